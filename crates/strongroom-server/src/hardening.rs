//! Process hardening: no core dumps, no swapped-out key material.
//!
//! Both functions are no-ops on non-Unix platforms.

/// Set `RLIMIT_CORE` to 0 so a crash never writes key material to disk.
/// Call before any key is loaded.
///
/// # Errors
///
/// Returns the OS error if `setrlimit` fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), String> {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid, initialized `rlimit` that outlives the call;
    // `setrlimit` only reads it.
    #[allow(unsafe_code)]
    let result = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) };

    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "setrlimit(RLIMIT_CORE, 0) failed: {}",
            std::io::Error::last_os_error()
        ))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), String> {
    Ok(())
}

/// Pin current and future pages with `mlockall`. Needs `CAP_IPC_LOCK` on
/// Linux; set `STRONGROOM_DISABLE_MLOCK=true` in development.
///
/// # Errors
///
/// Returns the OS error if `mlockall` fails.
#[cfg(unix)]
pub fn lock_memory() -> Result<(), String> {
    // SAFETY: `mlockall` takes only flags and touches no memory we own.
    #[allow(unsafe_code)]
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };

    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "mlockall(MCL_CURRENT | MCL_FUTURE) failed: {}",
            std::io::Error::last_os_error()
        ))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn lock_memory() -> Result<(), String> {
    Ok(())
}
