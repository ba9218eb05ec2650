//! Moving a node between Shamir and auto seals.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strongroom_core::barrier::KEYRING_PATH;
use strongroom_core::error::CoreError;
use strongroom_core::node::{Core, CoreConfig, HaRole, InitParams};
use strongroom_core::seal::{
    AutoSeal, BARRIER_CONFIG_PATH, RECOVERY_CONFIG_PATH, SHAMIR_SEAL_TYPE, STORED_KEYS_PATH,
    SealConfig, ShamirSeal, StaticKeyWrapper,
};
use strongroom_storage::{MemoryBackend, StorageBackend, StorageError};

use common::{KMS_MATERIAL, auto_seal, initialized, node, snapshot};

async fn auto_node(storage: &MemoryBackend) -> Core {
    let mut config = CoreConfig::new(Arc::new(storage.clone()));
    config.seal = Some(auto_seal(storage));
    Core::new(config).await.unwrap()
}

/// The persisted seal records, which a completed migration must not touch.
async fn seal_records(storage: &MemoryBackend) -> BTreeMap<String, Vec<u8>> {
    snapshot(storage, "core/")
        .await
        .into_iter()
        .filter(|(k, _)| {
            k == BARRIER_CONFIG_PATH || k == RECOVERY_CONFIG_PATH || k == STORED_KEYS_PATH
        })
        .collect()
}

/// Memory storage that fails the next write to one chosen key.
#[derive(Clone)]
struct FlakyStorage {
    inner: MemoryBackend,
    fail_next_put: Arc<Mutex<Option<String>>>,
}

impl FlakyStorage {
    fn new(inner: &MemoryBackend) -> Self {
        Self {
            inner: inner.clone(),
            fail_next_put: Arc::new(Mutex::new(None)),
        }
    }

    fn fail_next_put(&self, key: &str) {
        *self.fail_next_put.lock().unwrap() = Some(key.to_owned());
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let fail = {
            let mut armed = self.fail_next_put.lock().unwrap();
            if armed.as_deref() == Some(key) {
                armed.take();
                true
            } else {
                false
            }
        };
        if fail {
            return Err(StorageError::Write {
                key: key.to_owned(),
                reason: "transient".to_owned(),
            });
        }
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
}

async fn flaky_auto_node(storage: &FlakyStorage) -> Core {
    let storage: Arc<dyn StorageBackend> = Arc::new(storage.clone());
    let mut config = CoreConfig::new(Arc::clone(&storage));
    config.seal = Some(Arc::new(AutoSeal::new(
        storage,
        Arc::new(StaticKeyWrapper::new(KMS_MATERIAL).unwrap()),
    )));
    Core::new(config).await.unwrap()
}

/// Unseal a 1-of-1 Shamir node once so it writes barrier data, and return
/// the id of its wrapping key.
async fn activated_shamir(storage: &MemoryBackend, share: &[u8]) -> String {
    let core = node(storage).await;
    assert!(core.unseal(share).await.unwrap());
    let wrapping = core.wrapping_key_id().await.unwrap();
    core.shutdown().await.unwrap();
    wrapping
}

async fn physical_config(storage: &MemoryBackend, path: &str) -> Option<SealConfig> {
    storage
        .get(path)
        .await
        .unwrap()
        .map(|bytes| SealConfig::decode(path, &bytes).unwrap())
}

// ── Shamir to auto ───────────────────────────────────────────────────

#[tokio::test]
async fn shamir_to_auto_and_back_to_unattended_restarts() {
    let (storage, shamir_node, init) = initialized(5, 3).await;
    drop(shamir_node);

    let migrating = auto_node(&storage).await;
    assert!(migrating.is_in_seal_migration_mode().await);
    assert!(!migrating.is_seal_migrated().await.unwrap());

    // Shares must be flagged as migration shares.
    assert!(matches!(
        migrating.unseal(&init.secret_shares[0]).await,
        Err(CoreError::Migration { .. })
    ));

    assert!(!migrating.unseal_migrate(&init.secret_shares[0]).await.unwrap());
    assert!(!migrating.unseal_migrate(&init.secret_shares[2]).await.unwrap());
    assert!(migrating.unseal_migrate(&init.secret_shares[4]).await.unwrap());
    assert!(migrating.is_seal_migrated().await.unwrap());
    assert_eq!(migrating.ha_role().await, HaRole::Active);

    let barrier = physical_config(&storage, BARRIER_CONFIG_PATH).await.unwrap();
    assert_eq!(barrier.seal_type, "static");
    assert_eq!((barrier.secret_shares, barrier.secret_threshold), (1, 1));
    let recovery = physical_config(&storage, RECOVERY_CONFIG_PATH).await.unwrap();
    assert_eq!(recovery.seal_type, SHAMIR_SEAL_TYPE);
    assert_eq!((recovery.secret_shares, recovery.secret_threshold), (5, 3));
    migrating.shutdown().await.unwrap();

    // With the migration done, the auto seal unseals on its own.
    let restarted = auto_node(&storage).await;
    assert!(!restarted.is_in_seal_migration_mode().await);
    restarted.unseal_with_stored_keys().await.unwrap();
    assert!(!restarted.sealed());
    restarted.shutdown().await.unwrap();

    // The old unseal shares are now recovery shares.
    assert!(!restarted.unseal(&init.secret_shares[1]).await.unwrap());
    assert!(!restarted.unseal(&init.secret_shares[3]).await.unwrap());
    assert!(restarted.unseal(&init.secret_shares[4]).await.unwrap());
    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn migrated_seal_records_are_stable_across_restarts() {
    let (storage, shamir_node, init) = initialized(1, 1).await;
    drop(shamir_node);

    let migrating = auto_node(&storage).await;
    assert!(migrating.unseal_migrate(&init.secret_shares[0]).await.unwrap());
    migrating.shutdown().await.unwrap();

    let before = seal_records(&storage).await;
    assert_eq!(before.len(), 3);

    for _ in 0..2 {
        let core = auto_node(&storage).await;
        core.unseal_with_stored_keys().await.unwrap();
        core.shutdown().await.unwrap();
    }
    assert_eq!(seal_records(&storage).await, before);
}

#[tokio::test]
async fn repeated_migrate_unseal_succeeds_without_rewriting_records() {
    let (storage, shamir_node, init) = initialized(1, 1).await;
    drop(shamir_node);
    let share = &init.secret_shares[0];

    let migrating = auto_node(&storage).await;
    assert!(migrating.unseal_migrate(share).await.unwrap());
    let before = seal_records(&storage).await;

    // Already unsealed.
    assert!(migrating.unseal_migrate(share).await.unwrap());

    // Sealed again, the same share now opens the node through the new seal.
    migrating.shutdown().await.unwrap();
    assert!(migrating.unseal_migrate(share).await.unwrap());
    assert!(!migrating.sealed());
    assert_eq!(seal_records(&storage).await, before);
    migrating.shutdown().await.unwrap();
}

#[tokio::test]
async fn barrier_data_survives_migration_to_auto() {
    let (storage, shamir_node, init) = initialized(1, 1).await;
    drop(shamir_node);
    let share = &init.secret_shares[0];
    let wrapping = activated_shamir(&storage, share).await;

    let migrating = auto_node(&storage).await;
    assert!(migrating.unseal_migrate(share).await.unwrap());
    assert_eq!(migrating.wrapping_key_id().await.as_deref(), Some(wrapping.as_str()));
    migrating.shutdown().await.unwrap();

    let restarted = auto_node(&storage).await;
    restarted.unseal_with_stored_keys().await.unwrap();
    assert!(!restarted.sealed());
    assert_eq!(restarted.wrapping_key_id().await.as_deref(), Some(wrapping.as_str()));
    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_migration_write_leaves_node_recoverable() {
    for failing_key in [KEYRING_PATH, STORED_KEYS_PATH] {
        let (storage, shamir_node, init) = initialized(1, 1).await;
        drop(shamir_node);
        let share = &init.secret_shares[0];
        let wrapping = activated_shamir(&storage, share).await;

        let flaky = FlakyStorage::new(&storage);
        let migrating = flaky_auto_node(&flaky).await;
        flaky.fail_next_put(failing_key);
        assert!(
            matches!(
                migrating.unseal_migrate(share).await,
                Err(CoreError::Migration { .. })
            ),
            "write to {failing_key} should abort the migration"
        );
        assert!(migrating.sealed());
        assert!(!migrating.is_seal_migrated().await.unwrap());

        // The old seal still opens the barrier, so the migration can be retried.
        assert!(migrating.unseal_migrate(share).await.unwrap());
        assert!(migrating.is_seal_migrated().await.unwrap());
        assert_eq!(migrating.wrapping_key_id().await.as_deref(), Some(wrapping.as_str()));
        migrating.shutdown().await.unwrap();

        let restarted = auto_node(&storage).await;
        restarted.unseal_with_stored_keys().await.unwrap();
        assert!(!restarted.sealed());
        assert_eq!(restarted.wrapping_key_id().await.as_deref(), Some(wrapping.as_str()));
        restarted.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn shamir_node_cannot_start_on_auto_storage_without_disabled_seal() {
    let storage = MemoryBackend::new();
    let core = auto_node(&storage).await;
    core.initialize(InitParams {
        barrier: SealConfig::new("static", 1, 1, 1),
        recovery: Some(SealConfig::new(SHAMIR_SEAL_TYPE, 1, 1, 0)),
    })
    .await
    .unwrap();
    drop(core);

    let err = Core::new(CoreConfig::new(Arc::new(storage.clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Migration { .. }));
}

// ── Auto to Shamir ───────────────────────────────────────────────────

#[tokio::test]
async fn auto_to_shamir_uses_recovery_shares() {
    let storage = MemoryBackend::new();
    let auto = auto_node(&storage).await;
    let init = auto
        .initialize(InitParams {
            barrier: SealConfig::new("static", 1, 1, 1),
            recovery: Some(SealConfig::new(SHAMIR_SEAL_TYPE, 3, 2, 0)),
        })
        .await
        .unwrap();
    auto.unseal_with_stored_keys().await.unwrap();
    auto.shutdown().await.unwrap();
    drop(auto);

    let mut config = CoreConfig::new(Arc::new(storage.clone()));
    config.unwrap_seal = Some(auto_seal(&storage));
    let migrating = Core::new(config).await.unwrap();
    assert!(migrating.is_in_seal_migration_mode().await);
    let status = migrating.seal_status().await.unwrap();
    assert_eq!(status.seal_type, SHAMIR_SEAL_TYPE);
    assert!(status.migration);

    assert!(!migrating.unseal_migrate(&init.recovery_shares[0]).await.unwrap());
    assert!(migrating.unseal_migrate(&init.recovery_shares[1]).await.unwrap());
    migrating.shutdown().await.unwrap();

    let barrier = physical_config(&storage, BARRIER_CONFIG_PATH).await.unwrap();
    assert_eq!(barrier.seal_type, SHAMIR_SEAL_TYPE);
    assert_eq!(
        (barrier.secret_shares, barrier.secret_threshold, barrier.stored_shares),
        (3, 2, 1)
    );
    assert!(storage.get(RECOVERY_CONFIG_PATH).await.unwrap().is_none());

    let shamir = node(&storage).await;
    assert!(!shamir.is_in_seal_migration_mode().await);
    assert!(!shamir.unseal(&init.recovery_shares[2]).await.unwrap());
    assert!(shamir.unseal(&init.recovery_shares[0]).await.unwrap());
    shamir.shutdown().await.unwrap();
}

#[tokio::test]
async fn disabled_shamir_seal_is_rejected() {
    let (storage, core, _init) = initialized(1, 1).await;
    drop(core);

    let mut config = CoreConfig::new(Arc::new(storage.clone()));
    config.seal = Some(auto_seal(&storage));
    config.unwrap_seal = Some(Arc::new(ShamirSeal::new(Arc::new(storage.clone()))));
    let err = Core::new(config).await.unwrap_err();
    assert!(matches!(err, CoreError::Config { .. }));
}
