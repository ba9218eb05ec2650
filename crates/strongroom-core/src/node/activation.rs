//! Bringing subsystems up when the node becomes active, and down again.
//!
//! Setup runs in a fixed order and stops at the first failure, after which
//! whatever was already started is torn down. Teardown never stops early:
//! every step runs and failures are collected into [`TeardownErrors`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Core, CoreState, tasks};
use crate::crypto::{EncryptionKey, KEY_LEN};
use crate::error::{CoreError, TeardownErrors};
use crate::mount::{self, BarrierView, MountEntry, MountTable, TableKind};
use crate::subsystem::{ArtifactStore, LogicalBackend, PeriodicTask};

/// Physical path of the cluster feature flags.
pub const FEATURE_FLAGS_PATH: &str = "core/cluster/feature-flags";

/// Barrier prefix of the per-version first-activation records.
pub const VERSIONS_PREFIX: &str = "core/versions/";

/// Barrier path of the response-wrapping key.
pub const WRAPPING_KEY_PATH: &str = "core/wrapping/jwtkey";

/// Storage-layout features this cluster has written data with.
///
/// Readable while sealed, so tooling can tell what a node will find once it
/// unseals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Mount data is keyed by entry UUID rather than by path.
    #[serde(default)]
    pub uuid_mount_views: bool,
    /// The barrier keyring carries numbered key terms.
    #[serde(default)]
    pub keyring_terms: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionRecord {
    version: String,
    timestamp: DateTime<Utc>,
}

/// One loaded table and the backends instantiated for its entries.
#[derive(Default)]
struct MountedTable {
    table: MountTable,
    backends: Vec<(String, Arc<dyn LogicalBackend>)>,
}

/// Everything started by one activation.
pub(crate) struct ActiveSet {
    token: CancellationToken,
    tables: HashMap<TableKind, MountedTable>,
    artifacts: Vec<(&'static str, Arc<dyn ArtifactStore>)>,
    periodic: Vec<(&'static str, Arc<dyn PeriodicTask>)>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl ActiveSet {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tables: HashMap::new(),
            artifacts: Vec::new(),
            periodic: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// A token for one request, cancelled with the active services.
    pub(crate) fn request_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    fn spawn<F>(&mut self, name: &'static str, worker: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.workers.push((name, tokio::spawn(worker)));
    }
}

impl Core {
    /// Bring the node's subsystems up. On failure everything already started
    /// is torn down again and the error is returned; the caller reseals.
    pub(crate) async fn post_unseal(&self, state: &mut CoreState) -> Result<(), CoreError> {
        info!("post-unseal setup starting");
        let token = CancellationToken::new();
        *self.inner.active_cancel.lock().await = Some(token.clone());

        let mut set = ActiveSet::new(token);
        match self.activate(state, &mut set).await {
            Ok(()) => {
                state.active = Some(set);
                info!("post-unseal setup complete");
                Ok(())
            }
            Err(e) => {
                let errors = self.teardown(set).await;
                if !errors.is_empty() {
                    warn!(error = %errors, "cleanup after failed activation was incomplete");
                }
                Err(e)
            }
        }
    }

    async fn activate(&self, state: &mut CoreState, set: &mut ActiveSet) -> Result<(), CoreError> {
        let inner = &self.inner;
        let dr_secondary = inner.replication.is_dr_secondary();

        inner.cache.purge().await;
        inner.cache.set_enabled(!inner.disable_cache).await;

        inner.seal.set_cached_barrier_config(None).await;
        if inner.seal.recovery_key_supported() {
            inner.seal.set_cached_recovery_config(None).await;
        }

        state.active_time = Some(Utc::now());

        if !dr_secondary {
            self.persist_feature_flags().await?;
            set.spawn(
                "rotation",
                tasks::rotation_worker(
                    Arc::clone(&inner.barrier),
                    inner.rotation,
                    inner.rotation_check_interval,
                    set.token.child_token(),
                ),
            );
        }

        state.wrapping_key_id = Some(self.ensure_wrapping_key().await?);
        state.version_timestamps = self.record_version().await?;

        self.setup_table(set, TableKind::Secrets).await?;
        self.setup_table(set, TableKind::Credentials).await?;

        let collaborators = &inner.collaborators;
        if !dr_secondary {
            self.start_periodic(set, "expiration", collaborators.expiration.as_ref());
            self.start_periodic(set, "rollback", collaborators.rollback.as_ref());
            self.setup_table(set, TableKind::Audit).await?;
        }

        for (name, store) in [
            ("policy", collaborators.policy.as_ref()),
            ("identity", collaborators.identity.as_ref()),
        ] {
            let Some(store) = store else { continue };
            set.artifacts.push((name, Arc::clone(store)));
            let view = BarrierView::new(Arc::clone(&inner.barrier), format!("sys/{name}/"));
            store
                .load(view)
                .await
                .map_err(|e| CoreError::subsystem(name, e))?;
            debug!(store = store.name(), "artifacts loaded");
        }

        self.start_periodic(set, "activity", collaborators.activity.as_ref());

        set.spawn(
            "metrics",
            tasks::metrics_worker(
                Arc::clone(&inner.barrier),
                Arc::clone(&inner.cache),
                inner.metrics_interval,
                set.token.child_token(),
            ),
        );

        for hook in &collaborators.on_activation {
            hook.on_activation()
                .await
                .map_err(|e| CoreError::subsystem("activation hook", e))?;
        }
        Ok(())
    }

    fn start_periodic(
        &self,
        set: &mut ActiveSet,
        name: &'static str,
        task: Option<&Arc<dyn PeriodicTask>>,
    ) {
        let Some(task) = task else { return };
        set.periodic.push((name, Arc::clone(task)));
        set.spawn(
            name,
            tasks::periodic_worker(Arc::clone(task), set.token.child_token()),
        );
    }

    async fn setup_table(&self, set: &mut ActiveSet, kind: TableKind) -> Result<(), CoreError> {
        let loaded = MountTable::load(&self.inner.barrier, kind).await?;
        let mounted = set.tables.entry(kind).or_default();
        for entry in loaded.entries {
            let backend = self.instantiate(kind, &entry).await?;
            mounted.backends.push((entry.uuid.clone(), backend));
            mounted.table.entries.push(entry);
        }
        debug!(table = ?kind, mounts = mounted.table.entries.len(), "mount table set up");
        Ok(())
    }

    async fn instantiate(
        &self,
        kind: TableKind,
        entry: &MountEntry,
    ) -> Result<Arc<dyn LogicalBackend>, CoreError> {
        let factory = self
            .inner
            .collaborators
            .factories(kind)
            .get(&entry.mount_type)
            .ok_or_else(|| {
                CoreError::subsystem(
                    table_step(kind),
                    format!("unknown backend type '{}' at '{}'", entry.mount_type, entry.path),
                )
            })?;
        let view = BarrierView::for_entry(Arc::clone(&self.inner.barrier), kind, entry);
        factory
            .create(entry, view)
            .await
            .map_err(|e| CoreError::subsystem(table_step(kind), format!("{}: {e}", entry.path)))
    }

    /// Take down the active set, if any, before sealing or stepping down.
    pub(crate) async fn pre_seal(&self, state: &mut CoreState) -> TeardownErrors {
        info!("pre-seal teardown starting");
        let errors = match state.active.take() {
            Some(set) => self.teardown(set).await,
            None => {
                self.inner.cache.set_enabled(false).await;
                TeardownErrors::default()
            }
        };
        if errors.is_empty() {
            info!("pre-seal teardown complete");
        } else {
            warn!(error = %errors, "pre-seal teardown failed");
        }
        errors
    }

    async fn teardown(&self, mut set: ActiveSet) -> TeardownErrors {
        let mut errors = TeardownErrors::default();

        set.token.cancel();
        self.inner.active_cancel.lock().await.take();
        for (name, handle) in set.workers.drain(..) {
            if let Err(e) = handle.await {
                errors.push(name, CoreError::subsystem(name, e));
            }
        }

        unload_table(&mut set, TableKind::Audit, &mut errors).await;
        stop_periodic(&set, "expiration", &mut errors).await;
        unload_table(&mut set, TableKind::Credentials, &mut errors).await;
        for (name, store) in set.artifacts.iter().rev() {
            if let Err(e) = store.unload().await {
                errors.push(name, e);
            }
        }
        stop_periodic(&set, "rollback", &mut errors).await;
        unload_table(&mut set, TableKind::Secrets, &mut errors).await;
        stop_periodic(&set, "activity", &mut errors).await;

        self.inner.cache.set_enabled(false).await;
        errors
    }

    async fn persist_feature_flags(&self) -> Result<(), CoreError> {
        let flags = FeatureFlags {
            uuid_mount_views: true,
            keyring_terms: true,
        };
        let bytes = serde_json::to_vec(&flags).map_err(|e| CoreError::subsystem("feature flags", e))?;
        self.inner.storage.put(FEATURE_FLAGS_PATH, &bytes).await?;
        Ok(())
    }

    /// Read the cluster feature flags from physical storage. Works while
    /// sealed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if storage fails or the record is malformed.
    pub async fn read_feature_flags(&self) -> Result<Option<FeatureFlags>, CoreError> {
        let Some(bytes) = self.inner.storage.get(FEATURE_FLAGS_PATH).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CoreError::subsystem("feature flags", e))
    }

    /// Load the wrapping key, creating it on first activation. Returns its
    /// identifier.
    async fn ensure_wrapping_key(&self) -> Result<String, CoreError> {
        let barrier = &self.inner.barrier;
        let key = match barrier.get(WRAPPING_KEY_PATH).await? {
            Some(bytes) => EncryptionKey::from_slice(&bytes).map_err(|_| {
                tracing::error!(
                    expected = KEY_LEN,
                    actual = bytes.len(),
                    "stored wrapping key has the wrong length"
                );
                CoreError::Internal
            })?,
            None => {
                let key = EncryptionKey::generate();
                barrier.put(WRAPPING_KEY_PATH, key.as_bytes()).await?;
                info!("response-wrapping key generated");
                key
            }
        };
        let digest = Sha256::digest(key.as_bytes());
        Ok(hex::encode(&digest[..8]))
    }

    /// Record the first activation of this build's version and load every
    /// recorded version.
    async fn record_version(&self) -> Result<BTreeMap<String, DateTime<Utc>>, CoreError> {
        let barrier = &self.inner.barrier;
        let version = env!("CARGO_PKG_VERSION");
        let path = format!("{VERSIONS_PREFIX}{version}");
        if !barrier.exists(&path).await? {
            let record = VersionRecord {
                version: version.to_owned(),
                timestamp: Utc::now(),
            };
            let bytes = serde_json::to_vec(&record).map_err(|e| CoreError::subsystem("versions", e))?;
            barrier.put(&path, &bytes).await?;
            info!(version, "first activation of this version");
        }

        let mut timestamps = BTreeMap::new();
        for key in barrier.list(VERSIONS_PREFIX).await? {
            let Some(bytes) = barrier.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<VersionRecord>(&bytes) {
                Ok(record) => {
                    timestamps.insert(record.version, record.timestamp);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping malformed version record"),
            }
        }
        Ok(timestamps)
    }

    /// Add a mount to the active node.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] or [`CoreError::Standby`] if not active.
    /// - [`CoreError::Mount`] if the path is taken or invalid.
    /// - [`CoreError::Subsystem`] if the backend cannot be created.
    pub async fn mount(&self, kind: TableKind, entry: MountEntry) -> Result<MountEntry, CoreError> {
        let mut state = self.inner.state.write().await;
        let set = self.active_set(&mut state)?;
        let mounted = set.tables.entry(kind).or_default();

        let mut updated = mounted.table.clone();
        let entry = updated.insert(entry)?;
        let backend = self.instantiate(kind, &entry).await?;
        updated.persist(&self.inner.barrier, kind).await?;

        mounted.table = updated;
        mounted.backends.push((entry.uuid.clone(), backend));
        mount::log_change(kind, "mount", &entry);
        Ok(entry)
    }

    /// Remove a mount from the active node.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] or [`CoreError::Standby`] if not active.
    /// - [`CoreError::Mount`] if nothing is mounted at `path`.
    pub async fn unmount(&self, kind: TableKind, path: &str) -> Result<MountEntry, CoreError> {
        let mut state = self.inner.state.write().await;
        let set = self.active_set(&mut state)?;
        let mounted = set.tables.entry(kind).or_default();

        let mut updated = mounted.table.clone();
        let entry = updated.remove(path)?;
        updated.persist(&self.inner.barrier, kind).await?;
        mounted.table = updated;

        if let Some(index) = mounted.backends.iter().position(|(uuid, _)| *uuid == entry.uuid) {
            let (_, backend) = mounted.backends.remove(index);
            if let Err(e) = backend.unload().await {
                warn!(path = %entry.path, error = %e, "backend unload failed");
            }
        }
        mount::log_change(kind, "unmount", &entry);
        Ok(entry)
    }

    /// Entries of a mount table on the active node.
    ///
    /// # Errors
    ///
    /// [`CoreError::Sealed`] or [`CoreError::Standby`] if not active.
    pub async fn mounts(&self, kind: TableKind) -> Result<Vec<MountEntry>, CoreError> {
        let mut state = self.inner.state.write().await;
        let set = self.active_set(&mut state)?;
        Ok(set
            .tables
            .get(&kind)
            .map(|m| m.table.entries.clone())
            .unwrap_or_default())
    }

    fn active_set<'a>(&self, state: &'a mut CoreState) -> Result<&'a mut ActiveSet, CoreError> {
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        state.active.as_mut().ok_or(CoreError::Standby)
    }
}

fn table_step(kind: TableKind) -> &'static str {
    match kind {
        TableKind::Secrets => "mounts",
        TableKind::Credentials => "credentials",
        TableKind::Audit => "audit",
    }
}

async fn unload_table(set: &mut ActiveSet, kind: TableKind, errors: &mut TeardownErrors) {
    let Some(mounted) = set.tables.remove(&kind) else {
        return;
    };
    for (uuid, backend) in mounted.backends {
        if let Err(e) = backend.unload().await {
            debug!(uuid = %uuid, error = %e, "backend unload failed");
            errors.push(table_step(kind), e);
        }
    }
}

async fn stop_periodic(set: &ActiveSet, name: &'static str, errors: &mut TeardownErrors) {
    let Some((_, task)) = set.periodic.iter().find(|(n, _)| *n == name) else {
        return;
    };
    if let Err(e) = task.stop().await {
        errors.push(name, e);
    }
}
