//! The node coordinator.
//!
//! [`Core`] owns the seal, the barrier and the state lock, and moves the node
//! between three states:
//!
//! - **sealed**: the barrier refuses all access; only key shares, status
//!   queries and initialization are accepted.
//! - **standby**: the barrier is open but another node holds the HA lock.
//! - **active**: the node holds the HA lock (or has no HA backend) and has
//!   brought up its subsystems.
//!
//! # Security model
//!
//! - Key shares and the combined key are zeroized when dropped.
//! - A failed activation always reseals the barrier; the node never reports
//!   unsealed with a half-built subsystem set.
//! - The state lock is held exclusively across every transition. Requests
//!   hold its read side through a [`RequestGuard`], so sealing waits for
//!   them, and force-cancels them after `max_request_duration`.

mod activation;
mod ha;
mod lifecycle;
mod migration;
mod tasks;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use strongroom_storage::{CacheLayer, DEFAULT_CACHE_SIZE, HaBackend, StorageBackend};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::barrier::{Barrier, RotationPolicy};
use crate::error::CoreError;
use crate::replication::{ReplicationFlags, ReplicationState};
use crate::seal::{Seal, SealConfig, ShamirSeal};
use crate::subsystem::Collaborators;
use crate::unseal::UnsealSession;

pub use activation::FeatureFlags;
pub use ha::LeaderStatus;

use activation::ActiveSet;
use ha::StandbyHandle;
use migration::MigrationInfo;

/// Default bound on how long sealing waits for in-flight requests.
pub const DEFAULT_MAX_REQUEST_DURATION: Duration = Duration::from_secs(90);

/// Default pause after a manual step-down before contending again.
pub const DEFAULT_STEP_DOWN_SLEEP: Duration = Duration::from_secs(10);

/// Default and maximum lease TTL (32 days).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(32 * 24 * 3600);

/// Default time between automatic key rotation checks.
pub const DEFAULT_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(600);

/// Default time between metrics emissions.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Library configuration for a node.
#[derive(Clone)]
pub struct CoreConfig {
    /// Physical storage. Seal records are kept here in the clear; everything
    /// else goes through the barrier.
    pub storage: Arc<dyn StorageBackend>,
    /// Leadership coordination. `None` runs the node on its own.
    pub ha: Option<Arc<dyn HaBackend>>,
    /// The seal in use. Defaults to a Shamir seal over `storage`.
    pub seal: Option<Arc<dyn Seal>>,
    /// A disabled predecessor seal to migrate away from.
    pub unwrap_seal: Option<Arc<dyn Seal>>,
    /// Address other nodes redirect clients to. Required with HA.
    pub redirect_addr: Option<String>,
    /// Default lease TTL handed to mounts.
    pub default_lease_ttl: Duration,
    /// Upper bound for any lease TTL.
    pub max_lease_ttl: Duration,
    /// How long sealing waits for in-flight requests before cancelling them.
    pub max_request_duration: Duration,
    /// Pause after a manual step-down.
    pub step_down_sleep: Duration,
    /// When the barrier key term should be rotated automatically.
    pub rotation: RotationPolicy,
    /// Time between automatic rotation checks.
    pub rotation_check_interval: Duration,
    /// Time between metrics emissions.
    pub metrics_interval: Duration,
    /// Keep the physical read cache off even while active.
    pub disable_cache: bool,
    /// Most entries the physical read cache holds.
    pub cache_size: usize,
    /// Report the standby role as a performance standby.
    pub performance_standby: bool,
    /// Initial replication flags.
    pub replication: ReplicationFlags,
    /// Subsystems brought up on activation.
    pub collaborators: Collaborators,
}

impl CoreConfig {
    /// Defaults over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            ha: None,
            seal: None,
            unwrap_seal: None,
            redirect_addr: None,
            default_lease_ttl: DEFAULT_LEASE_TTL,
            max_lease_ttl: DEFAULT_LEASE_TTL,
            max_request_duration: DEFAULT_MAX_REQUEST_DURATION,
            step_down_sleep: DEFAULT_STEP_DOWN_SLEEP,
            rotation: RotationPolicy::default(),
            rotation_check_interval: DEFAULT_ROTATION_CHECK_INTERVAL,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            disable_cache: false,
            cache_size: DEFAULT_CACHE_SIZE,
            performance_standby: false,
            replication: ReplicationFlags::empty(),
            collaborators: Collaborators::default(),
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.ha.as_ref().is_some_and(|ha| ha.ha_enabled()) {
            let Some(addr) = self.redirect_addr.as_deref() else {
                return Err(CoreError::config(
                    "missing redirect address, required when HA is enabled",
                ));
            };
            if !addr.contains("://") {
                return Err(CoreError::config(format!(
                    "redirect address '{addr}' must include a scheme"
                )));
            }
        }
        if self.cache_size == 0 {
            return Err(CoreError::config("cache size must be at least one entry"));
        }
        if self.default_lease_ttl > self.max_lease_ttl {
            return Err(CoreError::config(
                "default lease TTL cannot be larger than the maximum lease TTL",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("ha", &self.ha.is_some())
            .field("seal", &self.seal.as_ref().map(|s| s.barrier_type().to_owned()))
            .field(
                "unwrap_seal",
                &self.unwrap_seal.as_ref().map(|s| s.barrier_type().to_owned()),
            )
            .field("redirect_addr", &self.redirect_addr)
            .field("max_request_duration", &self.max_request_duration)
            .field("disable_cache", &self.disable_cache)
            .field("cache_size", &self.cache_size)
            .field("replication", &self.replication)
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}

/// The node's role with respect to the HA lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaRole {
    /// Not holding the lock.
    Standby,
    /// Not holding the lock; labelled as able to serve reads.
    PerformanceStandby,
    /// Holding the lock (or running without HA) with subsystems up.
    Active,
}

/// Snapshot returned by [`Core::seal_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealStatus {
    /// Type of the configured seal.
    pub seal_type: String,
    /// Whether the node has been initialized.
    pub initialized: bool,
    /// Whether the barrier is sealed.
    pub sealed: bool,
    /// Shares needed; for auto seals, recovery shares.
    pub threshold: usize,
    /// Shares handed out.
    pub shares: usize,
    /// Distinct shares submitted in the current attempt.
    pub progress: usize,
    /// Identifier of the current attempt, empty if none.
    pub nonce: String,
    /// Whether a seal migration is pending.
    pub migration: bool,
    /// Whether the seal uses recovery keys.
    pub recovery_seal: bool,
}

/// Parameters for [`Core::initialize`].
#[derive(Debug, Clone)]
pub struct InitParams {
    /// How the unseal key is split. For auto seals it is forced to a single
    /// stored share.
    pub barrier: SealConfig,
    /// How the recovery key is split. Required for seals with recovery keys.
    pub recovery: Option<SealConfig>,
}

/// Shares produced by [`Core::initialize`]. Shown once, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct InitResult {
    /// Unseal key shares (empty for auto seals).
    pub secret_shares: Vec<Vec<u8>>,
    /// Recovery key shares (empty for Shamir seals).
    pub recovery_shares: Vec<Vec<u8>>,
}

impl fmt::Debug for InitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResult")
            .field("secret_shares", &self.secret_shares.len())
            .field("recovery_shares", &self.recovery_shares.len())
            .finish()
    }
}

/// A pending join to an existing cluster.
///
/// The node unseals with the leader's shares once `ready` becomes `true`,
/// by which time the leader's data must be present in local storage.
#[derive(Debug, Clone)]
pub struct ClusterJoin {
    /// The leader's barrier seal config, used for the share threshold.
    pub leader_barrier_config: SealConfig,
    /// Flips to `true` when local storage has caught up.
    pub ready: watch::Receiver<bool>,
}

/// Read access to the active node for the duration of one request.
///
/// Holding the guard delays sealing and step-down. Long-running work should
/// watch [`cancelled`](Self::cancelled) and stop when it fires.
pub struct RequestGuard {
    _state: OwnedRwLockReadGuard<CoreState>,
    token: CancellationToken,
}

impl RequestGuard {
    /// Cancelled when the active services are torn down.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the request should stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the request should stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

impl fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Everything guarded by the state lock.
pub(crate) struct CoreState {
    unlock: Option<UnsealSession>,
    migration: Option<MigrationInfo>,
    role: HaRole,
    active: Option<ActiveSet>,
    standby: Option<StandbyHandle>,
    cluster_join: Option<ClusterJoin>,
    active_time: Option<DateTime<Utc>>,
    version_timestamps: BTreeMap<String, DateTime<Utc>>,
    wrapping_key_id: Option<String>,
}

impl CoreState {
    fn new(migration: Option<MigrationInfo>) -> Self {
        Self {
            unlock: None,
            migration,
            role: HaRole::Standby,
            active: None,
            standby: None,
            cluster_join: None,
            active_time: None,
            version_timestamps: BTreeMap::new(),
            wrapping_key_id: None,
        }
    }
}

struct CoreInner {
    id: String,
    storage: Arc<dyn StorageBackend>,
    cache: Arc<CacheLayer>,
    barrier: Arc<Barrier>,
    seal: Arc<dyn Seal>,
    ha: Option<Arc<dyn HaBackend>>,
    redirect_addr: Option<String>,
    max_request_duration: Duration,
    step_down_sleep: Duration,
    rotation: RotationPolicy,
    rotation_check_interval: Duration,
    metrics_interval: Duration,
    disable_cache: bool,
    performance_standby: bool,
    collaborators: Collaborators,
    sealed: AtomicBool,
    migration_done: AtomicBool,
    replication: ReplicationState,
    /// The active-service token, reachable without the state lock so the
    /// drain timer can fire while a sealer waits for it.
    active_cancel: Mutex<Option<CancellationToken>>,
    /// Cancelled to request a step-down. Replaced on every activation.
    step_down: Mutex<Option<CancellationToken>>,
    state: Arc<RwLock<CoreState>>,
}

/// A secrets node. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Build a sealed node from `config`.
    ///
    /// If the stored seal type differs from the configured one, the node
    /// enters seal migration mode (see [`is_in_seal_migration_mode`]).
    ///
    /// [`is_in_seal_migration_mode`]: Self::is_in_seal_migration_mode
    ///
    /// # Errors
    ///
    /// - [`CoreError::Config`] if the configuration is invalid.
    /// - [`CoreError::Migration`] if the stored and configured seals cannot
    ///   be reconciled.
    pub async fn new(config: CoreConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let storage = Arc::clone(&config.storage);
        let cache = Arc::new(CacheLayer::with_capacity(
            Arc::clone(&storage),
            config.cache_size,
        ));
        let barrier = Arc::new(Barrier::new(Arc::clone(&cache) as Arc<dyn StorageBackend>));
        let seal = config
            .seal
            .unwrap_or_else(|| Arc::new(ShamirSeal::new(Arc::clone(&storage))));
        let ha = config.ha.filter(|ha| ha.ha_enabled());

        let core = Self {
            inner: Arc::new(CoreInner {
                id: uuid::Uuid::new_v4().to_string(),
                storage,
                cache,
                barrier,
                seal,
                ha,
                redirect_addr: config.redirect_addr,
                max_request_duration: config.max_request_duration,
                step_down_sleep: config.step_down_sleep,
                rotation: config.rotation,
                rotation_check_interval: config.rotation_check_interval,
                metrics_interval: config.metrics_interval,
                disable_cache: config.disable_cache,
                performance_standby: config.performance_standby,
                collaborators: config.collaborators,
                sealed: AtomicBool::new(true),
                migration_done: AtomicBool::new(false),
                replication: ReplicationState::new(config.replication),
                active_cancel: Mutex::new(None),
                step_down: Mutex::new(None),
                state: Arc::new(RwLock::new(CoreState::new(None))),
            }),
        };

        let migration = core.adjust_for_migration(config.unwrap_seal).await?;
        core.inner.state.write().await.migration = migration;
        tracing::debug!(node_id = %core.inner.id, ha = core.inner.ha.is_some(), "node created");
        Ok(core)
    }

    /// This node's identifier, also used as its HA lock value.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.id
    }

    /// The configured seal.
    #[must_use]
    pub fn seal_handle(&self) -> &Arc<dyn Seal> {
        &self.inner.seal
    }

    /// Whether the barrier is sealed.
    #[must_use]
    pub fn sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Whether a keyring and a barrier seal config both exist.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if storage or the seal config cannot be read.
    pub async fn initialized(&self) -> Result<bool, CoreError> {
        if !self.inner.barrier.initialized().await? {
            return Ok(false);
        }
        Ok(self.inner.seal.barrier_config().await?.is_some())
    }

    /// Shares submitted so far and the current attempt's nonce.
    pub async fn secret_progress(&self) -> (usize, String) {
        let state = self.inner.state.read().await;
        state
            .unlock
            .as_ref()
            .map_or((0, String::new()), |s| (s.progress(), s.nonce().to_owned()))
    }

    /// Discard submitted shares.
    pub async fn reset_unseal_process(&self) {
        let mut state = self.inner.state.write().await;
        if self.sealed() {
            state.unlock = None;
        }
    }

    /// Seal type, thresholds and unseal progress.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the seal configuration cannot be read.
    pub async fn seal_status(&self) -> Result<SealStatus, CoreError> {
        let seal = &self.inner.seal;
        let initialized = self.initialized().await?;
        let config = if seal.recovery_key_supported() {
            seal.recovery_config().await?
        } else {
            seal.barrier_config().await?
        };
        let (progress, nonce) = self.secret_progress().await;
        let state = self.inner.state.read().await;
        Ok(SealStatus {
            seal_type: seal.barrier_type().to_owned(),
            initialized,
            sealed: self.sealed(),
            threshold: config.as_ref().map_or(0, |c| c.secret_threshold),
            shares: config.as_ref().map_or(0, |c| c.secret_shares),
            progress,
            nonce,
            migration: state.migration.is_some(),
            recovery_seal: seal.recovery_key_supported(),
        })
    }

    /// The node's HA role.
    pub async fn ha_role(&self) -> HaRole {
        self.inner.state.read().await.role
    }

    /// Whether a seal migration is configured.
    pub async fn is_in_seal_migration_mode(&self) -> bool {
        self.inner.state.read().await.migration.is_some()
    }

    /// Whether a configured seal migration has completed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the stored seal state cannot be inspected.
    pub async fn is_seal_migrated(&self) -> Result<bool, CoreError> {
        let state = self.inner.state.read().await;
        if state.migration.is_none() {
            return Ok(false);
        }
        self.seal_migrated(&state).await
    }

    /// Current replication flags.
    #[must_use]
    pub fn replication_state(&self) -> &ReplicationState {
        &self.inner.replication
    }

    /// When the node last became active.
    pub async fn active_time(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().await.active_time
    }

    /// First-activation time of every version that has run on this storage.
    pub async fn version_timestamps(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.inner.state.read().await.version_timestamps.clone()
    }

    /// Identifier of the response-wrapping key, once active.
    pub async fn wrapping_key_id(&self) -> Option<String> {
        self.inner.state.read().await.wrapping_key_id.clone()
    }

    /// Register the start of a request.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] if the node is sealed.
    /// - [`CoreError::Standby`] if another node is active.
    pub async fn begin_request(&self) -> Result<RequestGuard, CoreError> {
        // A sealer queued on the state lock would otherwise block us.
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        let state = Arc::clone(&self.inner.state).read_owned().await;
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        if state.role != HaRole::Active {
            return Err(CoreError::Standby);
        }
        let token = state
            .active
            .as_ref()
            .map(ActiveSet::request_token)
            .ok_or(CoreError::Standby)?;
        Ok(RequestGuard {
            _state: state,
            token,
        })
    }

    fn standby_role(&self) -> HaRole {
        if self.inner.performance_standby {
            HaRole::PerformanceStandby
        } else {
            HaRole::Standby
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.inner.id)
            .field("seal", &self.inner.seal.barrier_type())
            .field("sealed", &self.sealed())
            .field("ha", &self.inner.ha.is_some())
            .finish_non_exhaustive()
    }
}
