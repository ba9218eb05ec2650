//! Strongroom daemon entry point.
//!
//! Bootstraps storage and the seal, builds the node, unseals it with stored
//! keys when the seal supports that, and seals it on SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use strongroom_core::node::{Core, CoreConfig};
use strongroom_core::seal::{AutoSeal, Seal, StaticKeyWrapper};
use strongroom_storage::{MemoryBackend, MemoryHaBackend, StorageBackend};
use tracing::{error, info, warn};

use strongroom_server::config::{NodeConfig, SealKind, StorageKind};
use strongroom_server::hardening;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::from_env().context("invalid configuration")?;

    // Runs before logging is initialized.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage, seal = ?config.seal, ha = config.ha, "strongroom starting");

    let core = build_core(&config).await?;
    info!(node_id = core.node_id(), "node ready");

    if core.initialized().await.context("failed to read seal status")? {
        match core.unseal_with_stored_keys().await {
            Ok(()) if !core.sealed() => info!("node unsealed with stored keys"),
            Ok(()) => info!("node is sealed, waiting for unseal keys"),
            Err(e) => warn!(error = %e, "auto-unseal failed, node stays sealed"),
        }
    } else {
        warn!("node is not initialized");
    }

    shutdown_signal().await;

    match tokio::time::timeout(config.shutdown_timeout, core.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if !e.is_fatal() => warn!(error = %e, "node sealed with teardown errors"),
        Ok(Err(e)) => error!(error = %e, "failed to seal node"),
        Err(_) => error!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "timed out sealing node"
        ),
    }

    info!("strongroom stopped");
    Ok(())
}

async fn build_core(config: &NodeConfig) -> anyhow::Result<Core> {
    let storage: Arc<dyn StorageBackend> = match &config.storage {
        StorageKind::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageKind::RocksDb { path } => {
            info!(path = %path, "using RocksDB storage");
            Arc::new(
                strongroom_storage::RocksDbBackend::open(path)
                    .context("failed to open RocksDB storage")?,
            )
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageKind::RocksDb { .. } => {
            anyhow::bail!("RocksDB storage requested but feature 'rocksdb-backend' is not enabled");
        }
    };

    let mut core_config = CoreConfig::new(Arc::clone(&storage));
    core_config.seal = match &config.seal {
        SealKind::Shamir => None,
        SealKind::Static { key } => Some(static_seal(&storage, key)?),
    };
    core_config.unwrap_seal = config
        .disabled_seal_key
        .as_deref()
        .map(|key| static_seal(&storage, key))
        .transpose()?;
    if config.ha {
        warn!("leadership is coordinated in-process only; other hosts will not see this lock");
        core_config.ha = Some(Arc::new(MemoryHaBackend::new()));
    }
    core_config.redirect_addr.clone_from(&config.redirect_addr);
    core_config.disable_cache = config.disable_cache;
    core_config.cache_size = config.cache_size;

    Core::new(core_config)
        .await
        .context("failed to build node")
}

fn static_seal(storage: &Arc<dyn StorageBackend>, key: &[u8]) -> anyhow::Result<Arc<dyn Seal>> {
    let wrapper = StaticKeyWrapper::new(key).context("invalid static seal key")?;
    Ok(Arc::new(AutoSeal::new(Arc::clone(storage), Arc::new(wrapper))))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, sealing node");
}

/// Uses `eprintln` because logging is not initialized yet.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &NodeConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via STRONGROOM_DISABLE_MLOCK, keys may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set STRONGROOM_DISABLE_MLOCK=true for dev)");
    }
}
