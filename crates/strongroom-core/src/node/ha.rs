//! Active/standby coordination.
//!
//! An unsealed node with an HA backend runs one standby task. The task
//! contends for the leadership lock, activates when it wins, waits for the
//! lock to be lost or for a manual step-down, tears down and contends again.
//! Every wait observes the stop token so the sealer can always end it; a
//! task stopped while holding the lock hands the lock back to the sealer,
//! which tears down and releases it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strongroom_storage::HaLock;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Core, CoreState, HaRole};
use crate::error::CoreError;

/// Key of the leadership lock.
pub const LOCK_PATH: &str = "core/lock";

/// Barrier prefix of leader advertisements.
pub const LEADER_PREFIX: &str = "core/leader/";

/// Pause before contending again after a lock or activation failure.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Who is active, as seen from this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderStatus {
    /// Whether this node is the active one.
    pub is_self: bool,
    /// The active node's redirect address, if one is advertised.
    pub leader_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaderAdvertisement {
    node_id: String,
    redirect_addr: String,
}

/// The running standby task.
pub(crate) struct StandbyHandle {
    pub(super) stop: CancellationToken,
    pub(super) task: JoinHandle<Option<Box<dyn HaLock>>>,
}

enum Activation {
    Active,
    Retry,
    Sealed,
}

impl Core {
    pub(super) fn spawn_standby(&self) -> StandbyHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_standby(self.clone(), stop.clone()));
        StandbyHandle { stop, task }
    }

    /// Take the state lock for a transition, cancelling in-flight requests
    /// if they hold it past `max_request_duration`. The active token is
    /// always cancelled once the lock is held.
    pub(super) async fn lock_draining(&self) -> OwnedRwLockWriteGuard<CoreState> {
        let acquired = CancellationToken::new();
        let _acquired_on_drop = acquired.clone().drop_guard();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                () = acquired.cancelled() => {}
                () = tokio::time::sleep(inner.max_request_duration) => {
                    if let Some(token) = inner.active_cancel.lock().await.as_ref() {
                        warn!("requests outlived the max request duration, cancelling them");
                        token.cancel();
                    }
                }
            }
        });

        let guard = Arc::clone(&self.inner.state).write_owned().await;
        if let Some(token) = self.inner.active_cancel.lock().await.as_ref() {
            token.cancel();
        }
        guard
    }

    async fn become_active(&self, state: &mut CoreState) -> Activation {
        if let Err(e) = self.migrate_seal(state).await {
            error!(error = %e, "seal migration failed, sealing");
            self.seal_from_standby_task(state).await;
            return Activation::Sealed;
        }
        if let Err(e) = self.post_unseal(state).await {
            error!(error = %e, "post-unseal setup failed");
            return Activation::Retry;
        }
        if let Err(e) = self.advertise_leader().await {
            error!(error = %e, "failed to advertise leader");
            self.pre_seal(state).await;
            return Activation::Retry;
        }
        if self.inner.seal.recovery_key_supported() {
            self.inner.seal.set_cached_recovery_config(None).await;
        }
        state.role = HaRole::Active;
        info!("active operation enabled");
        Activation::Active
    }

    async fn leave_active(&self, state: &mut CoreState) {
        if let Err(e) = self.clear_leader().await {
            warn!(error = %e, "failed to clear leader advertisement");
        }
        self.pre_seal(state).await;
        state.role = self.standby_role();
    }

    /// Seal from inside the standby task, which cannot wait for itself.
    async fn seal_from_standby_task(&self, state: &mut CoreState) {
        self.inner.sealed.store(true, std::sync::atomic::Ordering::SeqCst);
        state.standby = None;
        state.unlock = None;
        state.role = HaRole::Standby;
        self.drop_key_material(state).await;
        warn!("vault is sealed");
    }

    pub(super) async fn advertise_leader(&self) -> Result<(), CoreError> {
        let record = LeaderAdvertisement {
            node_id: self.inner.id.clone(),
            redirect_addr: self.inner.redirect_addr.clone().unwrap_or_default(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| CoreError::subsystem("leader", e))?;
        let own = format!("{LEADER_PREFIX}{}", self.inner.id);
        let barrier = &self.inner.barrier;
        barrier.put(&own, &bytes).await?;

        for key in barrier.list(LEADER_PREFIX).await? {
            if key != own {
                if let Err(e) = barrier.delete(&key).await {
                    warn!(key = %key, error = %e, "failed to remove stale leader entry");
                }
            }
        }
        Ok(())
    }

    pub(super) async fn clear_leader(&self) -> Result<(), CoreError> {
        self.inner
            .barrier
            .delete(&format!("{LEADER_PREFIX}{}", self.inner.id))
            .await?;
        Ok(())
    }

    /// Give up the active role. The node pauses for the configured step-down
    /// sleep before contending again.
    ///
    /// # Errors
    ///
    /// - [`CoreError::HaNotEnabled`] without an HA backend.
    /// - [`CoreError::Sealed`] if sealed.
    /// - [`CoreError::Standby`] if not active.
    pub async fn step_down(&self) -> Result<(), CoreError> {
        if self.inner.ha.is_none() {
            return Err(CoreError::HaNotEnabled);
        }
        let state = self.inner.state.read().await;
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        if state.role != HaRole::Active {
            return Err(CoreError::Standby);
        }
        info!("manual step-down requested");
        if let Some(token) = self.inner.step_down.lock().await.as_ref() {
            token.cancel();
        }
        drop(state);
        Ok(())
    }

    /// The active node, as advertised through the barrier.
    ///
    /// # Errors
    ///
    /// - [`CoreError::HaNotEnabled`] without an HA backend.
    /// - [`CoreError::Sealed`] if sealed.
    /// - [`CoreError::Storage`] if the lock holder cannot be read.
    pub async fn leader(&self) -> Result<LeaderStatus, CoreError> {
        let Some(ha) = self.inner.ha.as_ref() else {
            return Err(CoreError::HaNotEnabled);
        };
        let state = self.inner.state.read().await;
        if self.sealed() {
            return Err(CoreError::Sealed);
        }
        if state.role == HaRole::Active {
            return Ok(LeaderStatus {
                is_self: true,
                leader_address: self.inner.redirect_addr.clone(),
            });
        }

        let lock = ha.lock_with(LOCK_PATH, &self.inner.id)?;
        let Some(holder) = lock.value().await? else {
            return Ok(LeaderStatus {
                is_self: false,
                leader_address: None,
            });
        };
        let advertised = self
            .inner
            .barrier
            .get(&format!("{LEADER_PREFIX}{holder}"))
            .await?;
        let leader_address = match advertised {
            Some(bytes) => {
                let record: LeaderAdvertisement =
                    serde_json::from_slice(&bytes).map_err(|e| CoreError::subsystem("leader", e))?;
                Some(record.redirect_addr)
            }
            None => None,
        };
        Ok(LeaderStatus {
            is_self: false,
            leader_address,
        })
    }
}

/// The standby loop. Returns the held lock if stopped while holding it.
async fn run_standby(core: Core, stop: CancellationToken) -> Option<Box<dyn HaLock>> {
    let ha = Arc::clone(core.inner.ha.as_ref()?);
    info!("entering standby mode");

    loop {
        if stop.is_cancelled() {
            return None;
        }
        let lock = match ha.lock_with(LOCK_PATH, &core.inner.id) {
            Ok(lock) => lock,
            Err(e) => {
                error!(error = %e, "failed to create leadership lock");
                if pause(&stop, LOCK_RETRY_INTERVAL).await {
                    continue;
                }
                return None;
            }
        };

        debug!("contending for leadership lock");
        let lost = match lock.lock(stop.clone()).await {
            Ok(Some(lost)) => lost,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "failed to acquire leadership lock");
                if pause(&stop, LOCK_RETRY_INTERVAL).await {
                    continue;
                }
                return None;
            }
        };
        info!("acquired lock, enabling active operation");

        let mut state = tokio::select! {
            guard = Arc::clone(&core.inner.state).write_owned() => guard,
            () = stop.cancelled() => return Some(lock),
        };
        match core.become_active(&mut state).await {
            Activation::Active => {}
            Activation::Retry => {
                drop(state);
                release(lock.as_ref()).await;
                if pause(&stop, LOCK_RETRY_INTERVAL).await {
                    continue;
                }
                return None;
            }
            Activation::Sealed => {
                drop(state);
                release(lock.as_ref()).await;
                return None;
            }
        }
        let step_down = CancellationToken::new();
        *core.inner.step_down.lock().await = Some(step_down.clone());
        drop(state);

        let manual = tokio::select! {
            () = lost.cancelled() => {
                warn!("leadership lost, stopping active operation");
                false
            }
            () = step_down.cancelled() => {
                warn!("stepping down from active operation to standby");
                true
            }
            () = stop.cancelled() => return Some(lock),
        };

        let mut state = tokio::select! {
            guard = core.lock_draining() => guard,
            () = stop.cancelled() => return Some(lock),
        };
        core.inner.step_down.lock().await.take();
        core.leave_active(&mut state).await;
        drop(state);
        release(lock.as_ref()).await;
        info!("returned to standby");

        if manual && !pause(&stop, core.inner.step_down_sleep).await {
            return None;
        }
    }
}

async fn release(lock: &dyn HaLock) {
    if let Err(e) = lock.unlock().await {
        warn!(error = %e, "failed to release leadership lock");
    }
}

/// Sleep unless stopped first. Returns `false` if stopped.
async fn pause(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = stop.cancelled() => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use strongroom_storage::{MemoryBackend, MemoryHaBackend};

    use super::*;
    use crate::node::{CoreConfig, InitParams};
    use crate::seal::{SHAMIR_SEAL_TYPE, SealConfig};

    async fn reaches_role(core: &Core, role: HaRole) -> bool {
        for _ in 0..200 {
            if core.ha_role().await == role {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn ha_config(storage: &MemoryBackend, ha: &MemoryHaBackend, addr: &str) -> CoreConfig {
        let mut config = CoreConfig::new(Arc::new(storage.clone()));
        config.ha = Some(Arc::new(ha.clone()));
        config.redirect_addr = Some(addr.to_owned());
        config.step_down_sleep = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn step_down_without_ha_is_refused() {
        let core = Core::new(CoreConfig::new(Arc::new(MemoryBackend::new())))
            .await
            .unwrap();
        assert!(matches!(core.step_down().await, Err(CoreError::HaNotEnabled)));
        assert!(matches!(core.leader().await, Err(CoreError::HaNotEnabled)));
    }

    #[tokio::test]
    async fn single_node_becomes_active_and_advertises() {
        let storage = MemoryBackend::new();
        let ha = MemoryHaBackend::new();
        let core = Core::new(ha_config(&storage, &ha, "https://a:8200"))
            .await
            .unwrap();
        let init = core
            .initialize(InitParams {
                barrier: SealConfig::new(SHAMIR_SEAL_TYPE, 1, 1, 1),
                recovery: None,
            })
            .await
            .unwrap();
        assert!(core.unseal(&init.secret_shares[0]).await.unwrap());
        assert!(reaches_role(&core, HaRole::Active).await);

        let status = core.leader().await.unwrap();
        assert!(status.is_self);
        assert_eq!(status.leader_address.as_deref(), Some("https://a:8200"));
        assert!(core
            .inner
            .barrier
            .exists(&format!("{LEADER_PREFIX}{}", core.node_id()))
            .await
            .unwrap());

        core.seal().await.unwrap();
        assert!(core.sealed());
        assert_eq!(core.ha_role().await, HaRole::Standby);
        assert!(matches!(core.leader().await, Err(CoreError::Sealed)));
    }

    #[tokio::test]
    async fn lost_lock_returns_node_to_standby_and_it_recovers() {
        let storage = MemoryBackend::new();
        let ha = MemoryHaBackend::new();
        let core = Core::new(ha_config(&storage, &ha, "https://a:8200"))
            .await
            .unwrap();
        let init = core
            .initialize(InitParams {
                barrier: SealConfig::new(SHAMIR_SEAL_TYPE, 1, 1, 1),
                recovery: None,
            })
            .await
            .unwrap();
        core.unseal(&init.secret_shares[0]).await.unwrap();
        assert!(reaches_role(&core, HaRole::Active).await);
        let first_active = core.active_time().await.unwrap();

        ha.break_lock(LOCK_PATH).await;
        // With nobody else contending the node wins the lock straight back.
        for _ in 0..200 {
            if core.active_time().await.is_some_and(|t| t > first_active)
                && core.ha_role().await == HaRole::Active
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(core.active_time().await.unwrap() > first_active);
        core.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn step_down_racing_lock_loss_does_not_leak_into_next_term() {
        let storage = MemoryBackend::new();
        let ha = MemoryHaBackend::new();
        let core = Core::new(ha_config(&storage, &ha, "https://a:8200"))
            .await
            .unwrap();
        let init = core
            .initialize(InitParams {
                barrier: SealConfig::new(SHAMIR_SEAL_TYPE, 1, 1, 1),
                recovery: None,
            })
            .await
            .unwrap();
        core.unseal(&init.secret_shares[0]).await.unwrap();
        assert!(reaches_role(&core, HaRole::Active).await);
        let first_active = core.active_time().await.unwrap();

        // Both land before the standby task runs again.
        ha.break_lock(LOCK_PATH).await;
        core.step_down().await.unwrap();

        let mut second_active = None;
        for _ in 0..200 {
            if core.ha_role().await == HaRole::Active {
                second_active = core.active_time().await.filter(|t| *t > first_active);
                if second_active.is_some() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(second_active.is_some());

        // The new term must not step down on its own.
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(core.ha_role().await, HaRole::Active);
            assert_eq!(core.active_time().await, second_active);
        }

        core.step_down().await.unwrap();
        assert!(reaches_role(&core, HaRole::Standby).await);
        core.shutdown().await.unwrap();
    }
}
