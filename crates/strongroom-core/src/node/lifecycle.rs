//! Initialization, unsealing and sealing.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::{ClusterJoin, Core, CoreState, HaRole, InitParams, InitResult};
use crate::crypto::EncryptionKey;
use crate::error::{BarrierError, CoreError, TeardownErrors};
use crate::seal::{SHAMIR_SEAL_TYPE, Seal, SealConfig, StoredKeysSupport};
use crate::shamir;
use crate::unseal::{self, DeriveOptions, UnsealSession};

impl Core {
    /// Initialize storage: generate the root key, write the keyring and
    /// seal configs, and split the key operators will unseal with. The node
    /// stays sealed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::AlreadyInitialized`] if storage is already initialized.
    /// - [`CoreError::Config`] if a config is invalid, or a recovery config
    ///   is missing (or given) for a seal that does (or does not) use one.
    pub async fn initialize(&self, params: InitParams) -> Result<InitResult, CoreError> {
        let InitParams {
            barrier: mut barrier_config,
            recovery,
        } = params;
        let seal = Arc::clone(&self.inner.seal);

        let recovery_config = match (seal.recovery_key_supported(), recovery) {
            (true, Some(mut config)) => {
                config.seal_type = SHAMIR_SEAL_TYPE.to_owned();
                config.stored_shares = 0;
                config.validate()?;
                Some(config)
            }
            (true, None) => {
                return Err(CoreError::config(
                    "a recovery configuration is required for this seal",
                ));
            }
            (false, Some(_)) => {
                return Err(CoreError::config(
                    "recovery configuration is not supported by this seal",
                ));
            }
            (false, None) => None,
        };

        if seal.barrier_type() == SHAMIR_SEAL_TYPE {
            barrier_config.seal_type = SHAMIR_SEAL_TYPE.to_owned();
        } else {
            barrier_config = SealConfig::new(seal.barrier_type(), 1, 1, 1);
        }
        barrier_config.validate()?;

        let state = self.inner.state.write().await;
        if state.migration.is_some() {
            return Err(CoreError::migration("cannot initialize while migrating seals"));
        }
        if self.initialized().await? {
            return Err(CoreError::AlreadyInitialized);
        }

        let barrier = &self.inner.barrier;
        let root = barrier.generate_key();
        barrier.initialize(&root).await.map_err(|e| match e {
            BarrierError::AlreadyInitialized => CoreError::AlreadyInitialized,
            other => other.into(),
        })?;
        seal.set_barrier_config(Some(&barrier_config)).await?;

        let mut result = InitResult {
            secret_shares: Vec::new(),
            recovery_shares: Vec::new(),
        };
        if let Some(recovery_config) = &recovery_config {
            seal.set_recovery_config(Some(recovery_config)).await?;
            let recovery_key = EncryptionKey::generate();
            seal.set_recovery_key(recovery_key.as_bytes()).await?;
            seal.set_stored_keys(std::slice::from_ref(&root)).await?;
            result.recovery_shares = split_key(recovery_key.as_bytes(), recovery_config)?;
        } else if barrier_config.stored_shares == 0 {
            warn!("initializing with a legacy shamir config; the combined key is the root key");
            result.secret_shares = split_key(root.as_bytes(), &barrier_config)?;
        } else {
            let unseal_key = EncryptionKey::generate();
            seal.set_unseal_key(unseal_key.as_bytes()).await?;
            seal.set_stored_keys(std::slice::from_ref(&root)).await?;
            result.secret_shares = split_key(unseal_key.as_bytes(), &barrier_config)?;
        }
        seal.forget_keys().await;
        drop(state);

        info!(
            seal_type = seal.barrier_type(),
            shares = barrier_config.secret_shares,
            threshold = barrier_config.secret_threshold,
            recovery_shares = recovery_config.as_ref().map_or(0, |c| c.secret_shares),
            "node initialized"
        );
        Ok(result)
    }

    /// Submit one unseal (or, for auto seals, recovery) key share.
    ///
    /// Returns `true` once the node is unsealed. Shares below the threshold
    /// and repeated shares return `false` without error.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotInitialized`] if there is nothing to unseal.
    /// - [`CoreError::InvalidKey`] if the share has the wrong length or the
    ///   combined key is wrong.
    /// - [`CoreError::Migration`] if a seal migration is pending.
    /// - Any activation failure, in which case the node stays sealed.
    pub async fn unseal(&self, key: &[u8]) -> Result<bool, CoreError> {
        self.unseal_fragment(key, false).await
    }

    /// Submit one share of the predecessor seal's key during a seal
    /// migration. The migration is carried out once the threshold is met.
    ///
    /// # Errors
    ///
    /// As [`unseal`](Self::unseal), plus [`CoreError::Migration`] if no
    /// migration is configured.
    pub async fn unseal_migrate(&self, key: &[u8]) -> Result<bool, CoreError> {
        self.unseal_fragment(key, true).await
    }

    async fn unseal_fragment(&self, key: &[u8], migrate: bool) -> Result<bool, CoreError> {
        let mut state = self.inner.state.write().await;

        if migrate && state.migration.is_none() {
            return Err(CoreError::migration(
                "can't perform a seal migration, no migration seal found",
            ));
        }
        if migrate && state.cluster_join.is_some() {
            return Err(CoreError::migration(
                "can't perform a seal migration while joining a cluster",
            ));
        }
        let migrated = state.migration.is_some() && self.seal_migrated(&state).await?;
        if !migrate && state.migration.is_some() && !migrated {
            return Err(CoreError::migration(
                "migrate option not provided and seal migration is pending",
            ));
        }
        // After the migration the predecessor seal can no longer read the
        // stored keys, so late migrate submissions unseal normally.
        let migrate = migrate && !migrated;

        if state.cluster_join.is_none() && !self.initialized().await? {
            return Err(CoreError::NotInitialized);
        }

        let (min, max) = self.inner.barrier.key_length();
        unseal::validate_key_length(key, min, max)?;

        if !self.sealed() {
            return Ok(true);
        }

        let seal_to_use = match (&state.migration, migrate) {
            (Some(info), true) => {
                debug!("unsealing with the migration seal");
                Arc::clone(&info.seal)
            }
            _ => Arc::clone(&self.inner.seal),
        };

        if !state
            .unlock
            .get_or_insert_with(UnsealSession::new)
            .record_part(key)
        {
            return Ok(false);
        }

        let Some(combined) = self.combined_key(&mut state, seal_to_use.as_ref()).await? else {
            return Ok(false);
        };

        if migrate {
            if let Some(info) = state.migration.as_mut() {
                info.unseal_key = Some(combined.clone());
            }
        }

        if state.cluster_join.is_some() {
            self.finish_cluster_join(&state, combined);
            return Ok(false);
        }

        let options = DeriveOptions {
            use_test_seal: false,
            allow_missing: true,
        };
        let root = unseal::root_key_from_unseal_key(
            seal_to_use.as_ref(),
            &self.inner.storage,
            &combined,
            options,
        )
        .await?
        .ok_or_else(|| {
            error!("no stored root key found");
            CoreError::Internal
        })?;

        self.unseal_internal(&mut state, &root).await?;
        Ok(!self.sealed())
    }

    /// Combine the session's shares once the threshold is met. The session
    /// is discarded at that point whatever the outcome.
    async fn combined_key(
        &self,
        state: &mut CoreState,
        seal: &dyn Seal,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, CoreError> {
        let config = if seal.recovery_key_supported() {
            seal.recovery_config().await?
        } else if let Some(join) = &state.cluster_join {
            Some(join.leader_barrier_config.clone())
        } else {
            seal.barrier_config().await?
        };
        let config = config.ok_or(CoreError::NotInitialized)?;

        let Some(session) = state.unlock.as_ref() else {
            return Ok(None);
        };
        if session.progress() < config.secret_threshold {
            debug!(
                keys = session.progress(),
                threshold = config.secret_threshold,
                nonce = session.nonce(),
                "cannot unseal, not enough keys"
            );
            return Ok(None);
        }

        let Some(session) = state.unlock.take() else {
            return Ok(None);
        };
        let Some(combined) = session.attempt_combine(config.secret_threshold)? else {
            return Ok(None);
        };

        if seal.recovery_key_supported() {
            seal.verify_recovery_key(&combined).await.map_err(|e| {
                debug!(error = %e, "recovery key verification failed");
                CoreError::invalid_key("recovery key verification failed")
            })?;
        }
        Ok(Some(combined))
    }

    /// Open the barrier with `root` and, without HA, activate. With HA the
    /// standby task takes over.
    async fn unseal_internal(&self, state: &mut CoreState, root: &EncryptionKey) -> Result<(), CoreError> {
        self.inner.barrier.unseal(root).await?;

        if self.inner.ha.is_none() {
            if let Err(e) = self.migrate_seal(state).await {
                error!(error = %e, "seal migration error");
                self.drop_key_material(state).await;
                warn!("vault is sealed");
                return Err(e);
            }
            if let Err(e) = self.post_unseal(state).await {
                error!(error = %e, "post-unseal setup failed");
                self.drop_key_material(state).await;
                warn!("vault is sealed");
                return Err(e);
            }
            if self.inner.seal.recovery_key_supported() {
                self.inner.seal.set_cached_recovery_config(None).await;
            }
            state.role = HaRole::Active;
        } else {
            state.role = self.standby_role();
            state.standby = Some(self.spawn_standby());
        }

        self.inner.sealed.store(false, Ordering::SeqCst);
        info!("vault is unsealed");
        Ok(())
    }

    /// Forget every seal's key and close the barrier.
    pub(super) async fn drop_key_material(&self, state: &CoreState) {
        self.inner.seal.forget_keys().await;
        if let Some(info) = state.migration.as_ref() {
            info.seal.forget_keys().await;
        }
        self.inner.barrier.seal().await;
    }

    /// Unseal with keys the seal stores itself.
    ///
    /// Returns `Ok(())` without doing anything for seals that store no
    /// keys, or if already unsealed.
    ///
    /// # Errors
    ///
    /// Every failure is [`CoreError::NonFatal`]: the node keeps running
    /// sealed and operators can still unseal by hand.
    pub async fn unseal_with_stored_keys(&self) -> Result<(), CoreError> {
        let seal = Arc::clone(&self.inner.seal);
        if seal.barrier_type() == SHAMIR_SEAL_TYPE
            || seal.stored_keys_supported().await != StoredKeysSupport::Generic
        {
            return Ok(());
        }

        let mut state = self.inner.state.write().await;
        if state.migration.is_some() && !self.seal_migrated(&state).await.unwrap_or(false) {
            return Err(CoreError::non_fatal(CoreError::migration(
                "cannot auto-unseal during seal migration",
            )));
        }
        if !self.sealed() {
            warn!("attempted unseal with stored keys, but vault is already unsealed");
            return Ok(());
        }

        info!("stored unseal keys supported, attempting fetch");
        let keys = seal.get_stored_keys().await.map_err(|e| {
            CoreError::non_fatal(CoreError::subsystem(
                "stored keys",
                format!("fetching stored unseal keys failed: {e}"),
            ))
        })?;
        let root = match keys.as_slice() {
            [] => {
                return Err(CoreError::non_fatal(CoreError::subsystem(
                    "stored keys",
                    "stored unseal keys are supported, but none were found",
                )));
            }
            [root] => root,
            _ => {
                return Err(CoreError::non_fatal(CoreError::subsystem(
                    "stored keys",
                    "expected exactly one stored key",
                )));
            }
        };

        self.unseal_internal(&mut state, root)
            .await
            .map_err(CoreError::non_fatal)?;
        if self.sealed() {
            return Err(CoreError::non_fatal(CoreError::subsystem(
                "stored keys",
                "vault is still sealed after unsealing with stored keys",
            )));
        }
        info!("unsealed with stored key");
        Ok(())
    }

    /// Seal the node on operator request.
    ///
    /// A standby cannot be sealed this way; restart it instead.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Standby`] if the node is a standby.
    /// - [`CoreError::NonFatal`] wrapping [`CoreError::Teardown`] if some
    ///   subsystem failed to stop. The node is sealed regardless.
    pub async fn seal(&self) -> Result<(), CoreError> {
        if self.sealed() {
            return Ok(());
        }
        if self.inner.state.read().await.role != HaRole::Active {
            return Err(CoreError::Standby);
        }
        self.seal_internal().await
    }

    /// Seal the node whatever its role, as on process shutdown.
    ///
    /// # Errors
    ///
    /// [`CoreError::NonFatal`] wrapping [`CoreError::Teardown`] if some
    /// subsystem failed to stop. The node is sealed regardless.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.seal_internal().await
    }

    async fn seal_internal(&self) -> Result<(), CoreError> {
        if self.inner.sealed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("marked as sealed");

        let mut state = self.lock_draining().await;
        let mut errors = TeardownErrors::default();

        let mut held = None;
        if let Some(standby) = state.standby.take() {
            standby.stop.cancel();
            match standby.task.await {
                Ok(lock) => held = lock,
                Err(e) => errors.push("standby", CoreError::subsystem("standby", e)),
            }
        }
        if held.is_some() {
            if let Err(e) = self.clear_leader().await {
                errors.push("leader", e);
            }
        }
        errors.merge(self.pre_seal(&mut state).await);
        if let Some(lock) = held {
            if let Err(e) = lock.unlock().await {
                errors.push("ha lock", e.into());
            }
        }

        state.role = HaRole::Standby;
        state.unlock = None;
        self.drop_key_material(&state).await;
        drop(state);
        info!("vault is sealed");

        errors.into_result().map_err(CoreError::non_fatal)
    }

    /// Prepare to join an existing cluster. Unseal shares are then checked
    /// against the leader's config, and the unseal completes once `ready`
    /// reports that the leader's data has arrived.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyInitialized`] if this node has its own data.
    pub async fn begin_cluster_join(&self, join: ClusterJoin) -> Result<(), CoreError> {
        let mut state = self.inner.state.write().await;
        if self.initialized().await? {
            return Err(CoreError::AlreadyInitialized);
        }
        state.cluster_join = Some(join);
        info!("cluster join pending");
        Ok(())
    }

    fn finish_cluster_join(&self, state: &CoreState, combined: Zeroizing<Vec<u8>>) {
        let Some(join) = state.cluster_join.as_ref() else {
            return;
        };
        let mut ready = join.ready.clone();
        let core = self.clone();
        info!("unseal key accepted, waiting for cluster data");

        tokio::spawn(async move {
            if ready.wait_for(|r| *r).await.is_err() {
                warn!("cluster join abandoned before storage was ready");
                return;
            }
            let mut state = core.inner.state.write().await;
            if !core.sealed() {
                return;
            }
            let options = DeriveOptions {
                use_test_seal: false,
                allow_missing: false,
            };
            let seal = Arc::clone(&core.inner.seal);
            match unseal::root_key_from_unseal_key(seal.as_ref(), &core.inner.storage, &combined, options)
                .await
            {
                Ok(Some(root)) => {
                    state.cluster_join = None;
                    if let Err(e) = core.unseal_internal(&mut state, &root).await {
                        error!(error = %e, "failed to unseal after joining the cluster");
                    }
                }
                Ok(None) => error!("no root key found after joining the cluster"),
                Err(e) => error!(error = %e, "failed to derive root key after joining the cluster"),
            }
        });
    }
}

fn split_key(key: &[u8], config: &SealConfig) -> Result<Vec<Vec<u8>>, CoreError> {
    shamir::split(key, config.secret_shares, config.secret_threshold).map_err(|e| {
        error!(error = %e, "failed to split key");
        CoreError::Internal
    })
}
