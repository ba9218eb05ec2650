//! Error types for `strongroom-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material, only operation
//! descriptions. Errors that reach an operator (see [`CoreError::InvalidKey`]
//! and [`CoreError::Internal`]) never describe cryptographic internals.

use std::fmt;

use strongroom_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid header + nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// Key material of the wrong size was supplied.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Shamir split or combine failed.
    #[error("secret sharing failed: {reason}")]
    SecretSharing { reason: String },
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed; no logical reads or writes are possible.
    #[error("barrier is sealed")]
    Sealed,

    /// No keyring has been written yet.
    #[error("barrier is not initialized")]
    NotInitialized,

    /// A keyring already exists.
    #[error("barrier is already initialized")]
    AlreadyInitialized,

    /// The keyring could not be opened with the supplied root key.
    #[error("failed to decrypt keyring: {reason}")]
    Decrypt { reason: String },

    /// A value was encrypted under a key term the keyring does not contain.
    #[error("no key for term {term}")]
    UnknownTerm { term: u32 },

    /// A stored record could not be decoded.
    #[error("corrupt barrier record '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from seal implementations.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// A seal configuration failed validation.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// Stored key material could not be unwrapped with the current key.
    #[error("failed to decrypt stored keys: {reason}")]
    Decrypt { reason: String },

    /// The seal does not support the requested operation.
    #[error("seal type '{seal_type}' does not support {operation}")]
    Unsupported {
        seal_type: String,
        operation: &'static str,
    },

    /// The Shamir key-encryption key has not been supplied yet.
    #[error("seal key has not been set")]
    KeyNotSet,

    /// No recovery key is stored.
    #[error("recovery key not found")]
    RecoveryKeyNotFound,

    /// The candidate recovery key does not match the stored one.
    #[error("recovery key does not match")]
    RecoveryKeyMismatch,

    /// The external key wrapper failed.
    #[error("key wrapper '{wrapper}' failed: {reason}")]
    Wrapper { wrapper: String, reason: String },

    /// A persisted seal record could not be encoded or decoded.
    #[error("seal record '{key}' is malformed: {reason}")]
    Serialization { key: String, reason: String },

    /// A cryptographic operation failed.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("seal storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from mount table management.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// A mount already exists at this path.
    #[error("path '{path}' is already in use")]
    AlreadyMounted { path: String },

    /// No mount exists at this path.
    #[error("no mount at '{path}'")]
    NotFound { path: String },

    /// The mount path is malformed.
    #[error("invalid mount path: {reason}")]
    InvalidPath { reason: String },

    /// The persisted table could not be encoded or decoded.
    #[error("mount table '{key}' is malformed: {reason}")]
    Serialization { key: String, reason: String },

    /// The barrier returned an error.
    #[error("mount table barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// One failed step of a best-effort teardown.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Name of the teardown step.
    pub step: &'static str,
    /// What went wrong.
    pub error: CoreError,
}

/// Failures accumulated while tearing down the active set.
#[derive(Debug, Default)]
pub struct TeardownErrors(pub Vec<TeardownFailure>);

impl TeardownErrors {
    /// Record a failed step.
    pub fn push(&mut self, step: &'static str, error: CoreError) {
        self.0.push(TeardownFailure { step, error });
    }

    /// Append the failures from another teardown.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// `Ok(())` if nothing failed, otherwise the accumulated errors.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Teardown`] when at least one step failed.
    pub fn into_result(self) -> Result<(), CoreError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Teardown(self))
        }
    }

    /// Number of failed steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} teardown step(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(f, "; {}: {}", failure.step, failure.error)?;
        }
        Ok(())
    }
}

/// Errors surfaced by [`Core`](crate::node::Core).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No seal configuration has been persisted yet.
    #[error("node is not initialized")]
    NotInitialized,

    /// Initialization was requested on an initialized node.
    #[error("node is already initialized")]
    AlreadyInitialized,

    /// A user-supplied key was rejected. The reason is shown to the caller
    /// and must never describe cryptographic detail.
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Stored material could not be decrypted with the current key.
    #[error("decrypt error: {reason}")]
    Decrypt { reason: String },

    /// An opaque failure. Detail is logged where it happens, never returned.
    #[error("internal error")]
    Internal,

    /// A problem that should be reported without aborting startup.
    #[error("{0}")]
    NonFatal(Box<CoreError>),

    /// Malformed seal, threshold, or node configuration.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// The node is sealed.
    #[error("node is sealed")]
    Sealed,

    /// The operation requires the active node.
    #[error("node is in standby mode")]
    Standby,

    /// The operation only makes sense with HA storage.
    #[error("node is not configured for high availability")]
    HaNotEnabled,

    /// Seal migration could not proceed.
    #[error("seal migration: {reason}")]
    Migration { reason: String },

    /// One or more best-effort teardown steps failed.
    #[error("{0}")]
    Teardown(TeardownErrors),

    /// A collaborator (backend, audit sink, store) failed.
    #[error("subsystem '{name}' failed: {reason}")]
    Subsystem { name: String, reason: String },

    /// A mount table operation failed.
    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    /// The barrier returned an error.
    #[error("barrier error: {0}")]
    Barrier(BarrierError),

    /// A seal operation failed.
    #[error("seal error: {0}")]
    Seal(SealError),

    /// The storage backend returned an error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CoreError {
    /// Wrap an error so that callers treat it as a warning.
    #[must_use]
    pub fn non_fatal(err: CoreError) -> Self {
        Self::NonFatal(Box::new(err))
    }

    /// Whether this error should abort the caller.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NonFatal(_))
    }

    /// Build an invalid-key error.
    pub(crate) fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub(crate) fn subsystem(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Subsystem {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn migration(reason: impl Into<String>) -> Self {
        Self::Migration {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

impl From<SealError> for CoreError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::Decrypt { reason } => Self::Decrypt { reason },
            SealError::InvalidConfig { reason } => Self::Config { reason },
            other => Self::Seal(other),
        }
    }
}

impl From<BarrierError> for CoreError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::Sealed => Self::Sealed,
            BarrierError::Decrypt { reason } => Self::Decrypt { reason },
            other => Self::Barrier(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_fatal_is_not_fatal() {
        let err = CoreError::non_fatal(CoreError::config("mlock unavailable"));
        assert!(!err.is_fatal());
        assert!(CoreError::Internal.is_fatal());
        assert_eq!(err.to_string(), "invalid configuration: mlock unavailable");
    }

    #[test]
    fn internal_error_does_not_leak_detail() {
        assert_eq!(CoreError::Internal.to_string(), "internal error");
    }

    #[test]
    fn seal_decrypt_maps_to_core_decrypt() {
        let err: CoreError = SealError::Decrypt {
            reason: "tag mismatch".to_owned(),
        }
        .into();
        assert!(matches!(err, CoreError::Decrypt { .. }));
    }

    #[test]
    fn teardown_errors_accumulate() {
        let mut errs = TeardownErrors::default();
        assert!(errs.is_empty());
        errs.push("audit", CoreError::Internal);
        errs.push("mounts", CoreError::Sealed);
        assert_eq!(errs.len(), 2);
        let mut more = TeardownErrors::default();
        more.push("ha lock", CoreError::Internal);
        errs.merge(more);
        assert_eq!(errs.len(), 3);
        let msg = errs.to_string();
        assert!(msg.starts_with("3 teardown step(s) failed"));
        assert!(msg.contains("audit: internal error"));
        assert!(matches!(errs.into_result(), Err(CoreError::Teardown(_))));
    }
}
