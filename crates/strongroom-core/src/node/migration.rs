//! Moving a node from one seal to another.
//!
//! A migration is configured, not requested: the node starts with the new
//! seal plus either an explicitly disabled predecessor or, for a Shamir
//! predecessor, nothing at all, and notices that the persisted seal type
//! differs. Operators then unseal with the migrate option using the
//! predecessor's shares, and the key material is moved to the new seal as
//! part of that unseal.
//!
//! Supported moves are auto to auto, auto to Shamir and Shamir to auto.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::{Core, CoreState};
use crate::error::{CoreError, SealError};
use crate::seal::{BARRIER_CONFIG_PATH, RECOVERY_CONFIG_PATH, SHAMIR_SEAL_TYPE, Seal, SealConfig, ShamirSeal};

/// The predecessor seal and, once the migrate-unseal has combined it, its key.
pub(crate) struct MigrationInfo {
    pub(super) seal: Arc<dyn Seal>,
    pub(super) unseal_key: Option<Zeroizing<Vec<u8>>>,
}

impl Core {
    /// Seal configs as persisted, bypassing any seal's cached copy.
    async fn physical_seal_configs(
        &self,
    ) -> Result<(Option<SealConfig>, Option<SealConfig>), CoreError> {
        let storage = &self.inner.storage;
        let barrier = match storage.get(BARRIER_CONFIG_PATH).await? {
            Some(bytes) => Some(SealConfig::decode(BARRIER_CONFIG_PATH, &bytes)?),
            None => None,
        };
        let recovery = match storage.get(RECOVERY_CONFIG_PATH).await? {
            Some(bytes) => Some(SealConfig::decode(RECOVERY_CONFIG_PATH, &bytes)?),
            None => None,
        };
        Ok((barrier, recovery))
    }

    /// Compare the persisted seal type with the configured one and decide
    /// whether the node starts in migration mode.
    pub(super) async fn adjust_for_migration(
        &self,
        unwrap_seal: Option<Arc<dyn Seal>>,
    ) -> Result<Option<MigrationInfo>, CoreError> {
        let (existing, existing_recovery) = self.physical_seal_configs().await?;
        let Some(existing) = existing else {
            return Ok(None);
        };

        let configured = self.inner.seal.barrier_type();
        let stored = existing.seal_type.as_str();

        let predecessor: Arc<dyn Seal> = match unwrap_seal {
            None => {
                if stored == configured {
                    return Ok(None);
                }
                if configured == SHAMIR_SEAL_TYPE {
                    return Err(CoreError::migration(format!(
                        "cannot seal migrate from {stored} to Shamir, no disabled seal in configuration"
                    )));
                }
                if stored != SHAMIR_SEAL_TYPE {
                    return Err(CoreError::migration(format!(
                        "cannot seal migrate from {stored} to {configured}, no disabled seal in configuration"
                    )));
                }
                Arc::new(ShamirSeal::new(Arc::clone(&self.inner.storage)))
            }
            Some(unwrap) => {
                if unwrap.barrier_type() == SHAMIR_SEAL_TYPE {
                    return Err(CoreError::config(
                        "Shamir seals cannot be set disabled (they should simply not be set)",
                    ));
                }
                unwrap
            }
        };

        if stored != SHAMIR_SEAL_TYPE && existing_recovery.is_none() {
            return Err(CoreError::migration(
                "recovery seal configuration not found for existing seal",
            ));
        }

        if stored != configured {
            self.adjust_seal_config_during_migration(&existing, existing_recovery.as_ref())
                .await;
        }

        warn!(
            from = predecessor.barrier_type(),
            to = configured,
            "entering seal migration mode; unseal with the migrate option to proceed"
        );
        Ok(Some(MigrationInfo {
            seal: predecessor,
            unseal_key: None,
        }))
    }

    /// Give the new seal the configs it will have once migration is done, so
    /// status and initialization checks see sensible values meanwhile.
    async fn adjust_seal_config_during_migration(
        &self,
        existing: &SealConfig,
        existing_recovery: Option<&SealConfig>,
    ) {
        let seal = &self.inner.seal;
        let to_shamir = seal.barrier_type() == SHAMIR_SEAL_TYPE;
        let from_shamir = existing.seal_type == SHAMIR_SEAL_TYPE;

        if !from_shamir && to_shamir {
            if let Some(recovery) = existing_recovery {
                let mut barrier = recovery.clone();
                barrier.stored_shares = 1;
                seal.set_cached_barrier_config(Some(barrier)).await;
            }
        } else if from_shamir && !to_shamir {
            let barrier = SealConfig::new(seal.barrier_type(), 1, 1, 1);
            let mut recovery = existing.clone();
            recovery.stored_shares = 0;
            seal.set_cached_barrier_config(Some(barrier)).await;
            seal.set_cached_recovery_config(Some(recovery)).await;
        }
    }

    /// Whether the configured migration has already been carried out.
    pub(super) async fn seal_migrated(&self, state: &CoreState) -> Result<bool, CoreError> {
        if self.inner.migration_done.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let Some(info) = state.migration.as_ref() else {
            return Ok(false);
        };

        let (barrier, recovery) = self.physical_seal_configs().await?;
        let seal = &self.inner.seal;
        let Some(barrier) = barrier else {
            return Ok(false);
        };
        if barrier.seal_type != seal.barrier_type() {
            return Ok(false);
        }
        if seal.recovery_key_supported()
            && !recovery.is_some_and(|r| r.seal_type == SHAMIR_SEAL_TYPE)
        {
            return Ok(false);
        }
        if seal.barrier_type() != info.seal.barrier_type() {
            return Ok(true);
        }

        // Same seal type on both sides: the stored keys tell which one
        // currently owns them.
        let new_keys = seal.get_stored_keys().await;
        if new_keys.as_ref().is_ok_and(|k| !k.is_empty()) {
            return Ok(true);
        }
        let old_keys = info.seal.get_stored_keys().await;
        if old_keys.as_ref().is_ok_and(|k| !k.is_empty()) {
            return Ok(false);
        }
        match (new_keys, old_keys) {
            (Err(new), Err(old)) => Err(CoreError::migration(format!(
                "failed to decrypt stored keys with either the new or old seal: new={new}, old={old}"
            ))),
            _ => Err(CoreError::migration(
                "unable to determine the seal migration status",
            )),
        }
    }

    /// Move key material to the new seal. A no-op when not migrating or when
    /// already migrated.
    pub(super) async fn migrate_seal(&self, state: &mut CoreState) -> Result<(), CoreError> {
        if state.migration.is_none() {
            return Ok(());
        }
        if self.seal_migrated(state).await? {
            debug!("seal migration already performed");
            return Ok(());
        }
        let Some(info) = state.migration.as_mut() else {
            return Ok(());
        };

        let old = Arc::clone(&info.seal);
        let new = Arc::clone(&self.inner.seal);
        info!(from = old.barrier_type(), to = new.barrier_type(), "seal migration initiated");

        match (old.recovery_key_supported(), new.recovery_key_supported()) {
            (true, true) => {
                info!("migrating from one auto-unseal to another");
                let recovery_key = old
                    .recovery_key()
                    .await
                    .map_err(|e| step_error("reading recovery key from old seal", e))?;
                new.set_recovery_key(&recovery_key)
                    .await
                    .map_err(|e| step_error("setting recovery key on new seal", e))?;
                let keys = old
                    .get_stored_keys()
                    .await
                    .map_err(|e| step_error("reading stored keys from old seal", e))?;
                new.set_stored_keys(&keys)
                    .await
                    .map_err(|e| step_error("storing keys with new seal", e))?;
            }
            (true, false) => {
                info!("migrating from auto-unseal to shamir");
                let recovery_key = old
                    .recovery_key()
                    .await
                    .map_err(|e| step_error("reading recovery key from old seal", e))?;
                new.set_unseal_key(&recovery_key)
                    .await
                    .map_err(|e| step_error("setting shamir key from recovery key", e))?;
                let keys = old
                    .get_stored_keys()
                    .await
                    .map_err(|e| step_error("reading stored keys from old seal", e))?;
                new.set_stored_keys(&keys)
                    .await
                    .map_err(|e| step_error("storing keys with new seal", e))?;
            }
            (false, true) => {
                info!("migrating from shamir to auto-unseal");
                let unseal_key = info
                    .unseal_key
                    .as_ref()
                    .ok_or_else(|| CoreError::migration("no unseal key captured for migration"))?;
                new.set_recovery_key(unseal_key)
                    .await
                    .map_err(|e| step_error("setting recovery key on new seal", e))?;

                // The stored-keys record is shared with the old seal, so it
                // must keep the previous root until the keyring has moved.
                let previous = self.inner.barrier.root_key().await?;
                let root = self.inner.barrier.generate_key();
                // Also covers legacy Shamir records that never stored a root key.
                self.inner
                    .barrier
                    .rekey(&root)
                    .await
                    .map_err(|e| CoreError::migration(format!("rekeying barrier: {e}")))?;
                if let Err(e) = new.set_stored_keys(std::slice::from_ref(&root)).await {
                    if let Err(undo) = self.inner.barrier.rekey(&previous).await {
                        error!(error = %undo, "failed to restore the previous root key");
                    }
                    return Err(step_error("storing new root key", e));
                }
            }
            (false, false) => {
                return Err(CoreError::migration(
                    "unhandled migration case (shamir to shamir)",
                ));
            }
        }

        self.migrate_seal_config(old.as_ref()).await?;
        info.unseal_key = None;
        self.inner.migration_done.store(true, Ordering::SeqCst);
        info!("seal migration complete");
        Ok(())
    }

    /// Rewrite the persisted seal configs for the new seal.
    async fn migrate_seal_config(&self, old: &dyn Seal) -> Result<(), CoreError> {
        let (existing, existing_recovery) = self.physical_seal_configs().await?;
        let existing = existing.ok_or(CoreError::NotInitialized)?;
        let new = &self.inner.seal;

        let (barrier, recovery) = match (old.recovery_key_supported(), new.recovery_key_supported()) {
            (true, true) => {
                let mut barrier = existing;
                barrier.seal_type = new.barrier_type().to_owned();
                (barrier, existing_recovery)
            }
            (true, false) => {
                let mut barrier = existing_recovery.ok_or_else(|| {
                    CoreError::migration("recovery seal configuration not found for existing seal")
                })?;
                barrier.seal_type = SHAMIR_SEAL_TYPE.to_owned();
                barrier.stored_shares = 1;
                (barrier, None)
            }
            (false, true) => {
                let barrier = SealConfig::new(new.barrier_type(), 1, 1, 1);
                let mut recovery = existing;
                recovery.seal_type = SHAMIR_SEAL_TYPE.to_owned();
                recovery.stored_shares = 0;
                (barrier, Some(recovery))
            }
            (false, false) => {
                return Err(CoreError::migration(
                    "unhandled migration case (shamir to shamir)",
                ));
            }
        };

        new.set_barrier_config(Some(&barrier))
            .await
            .map_err(|e| step_error("writing barrier seal config", e))?;
        if new.recovery_key_supported() {
            new.set_recovery_config(recovery.as_ref())
                .await
                .map_err(|e| step_error("writing recovery seal config", e))?;
        } else {
            self.inner.storage.delete(RECOVERY_CONFIG_PATH).await?;
        }
        Ok(())
    }
}

fn step_error(step: &str, err: SealError) -> CoreError {
    CoreError::migration(format!("{step}: {err}"))
}
