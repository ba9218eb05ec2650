//! Shared fixtures for the node integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use strongroom_core::node::{Core, CoreConfig, HaRole, InitParams, InitResult};
use strongroom_core::seal::{AutoSeal, SHAMIR_SEAL_TYPE, Seal, SealConfig, StaticKeyWrapper};
use strongroom_storage::{MemoryBackend, StorageBackend};

/// Key material for the static wrapper used throughout the tests.
pub const KMS_MATERIAL: &[u8] = b"integration-test-kms";

pub fn shamir(shares: usize, threshold: usize) -> InitParams {
    InitParams {
        barrier: SealConfig::new(SHAMIR_SEAL_TYPE, shares, threshold, 1),
        recovery: None,
    }
}

pub fn auto_seal(storage: &MemoryBackend) -> Arc<dyn Seal> {
    Arc::new(AutoSeal::new(
        Arc::new(storage.clone()),
        Arc::new(StaticKeyWrapper::new(KMS_MATERIAL).unwrap()),
    ))
}

pub async fn node(storage: &MemoryBackend) -> Core {
    Core::new(CoreConfig::new(Arc::new(storage.clone())))
        .await
        .unwrap()
}

/// A Shamir node over fresh storage, initialized but sealed.
pub async fn initialized(shares: usize, threshold: usize) -> (MemoryBackend, Core, InitResult) {
    let storage = MemoryBackend::new();
    let core = node(&storage).await;
    let init = core.initialize(shamir(shares, threshold)).await.unwrap();
    (storage, core, init)
}

/// Every key and value in `storage` under `prefix`.
pub async fn snapshot(storage: &MemoryBackend, prefix: &str) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for key in storage.list(prefix).await.unwrap() {
        if let Some(value) = storage.get(&key).await.unwrap() {
            out.insert(key, value);
        }
    }
    out
}

/// Copy everything from `from` into `to`.
pub async fn replicate(from: &MemoryBackend, to: &MemoryBackend) {
    for (key, value) in snapshot(from, "").await {
        to.put(&key, &value).await.unwrap();
    }
}

/// Poll until `core` reports `role`, for at most two seconds.
pub async fn reaches_role(core: &Core, role: HaRole) -> bool {
    for _ in 0..200 {
        if !core.sealed() && core.ha_role().await == role {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until `core` is unsealed, for at most two seconds.
pub async fn becomes_unsealed(core: &Core) -> bool {
    for _ in 0..200 {
        if !core.sealed() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
