//! Initialize, unseal and seal a node end to end.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use strongroom_core::error::CoreError;
use strongroom_core::node::{ClusterJoin, Core, CoreConfig, HaRole, InitParams};
use strongroom_core::seal::{SHAMIR_SEAL_TYPE, SealConfig};
use strongroom_core::subsystem::{ActivationHook, Collaborators};
use strongroom_storage::{MemoryBackend, RocksDbBackend, StorageBackend};
use tokio::sync::watch;

use common::{auto_seal, becomes_unsealed, initialized, node, replicate, shamir};

// ── Threshold unseal ─────────────────────────────────────────────────

#[tokio::test]
async fn three_of_five_unseals_and_reports_progress() {
    let (_storage, core, init) = initialized(5, 3).await;

    let status = core.seal_status().await.unwrap();
    assert!(status.initialized);
    assert!(status.sealed);
    assert_eq!((status.shares, status.threshold, status.progress), (5, 3, 0));

    assert!(!core.unseal(&init.secret_shares[4]).await.unwrap());
    assert!(!core.unseal(&init.secret_shares[1]).await.unwrap());
    let status = core.seal_status().await.unwrap();
    assert_eq!(status.progress, 2);
    assert!(!status.nonce.is_empty());

    assert!(core.unseal(&init.secret_shares[2]).await.unwrap());
    let status = core.seal_status().await.unwrap();
    assert!(!status.sealed);
    assert_eq!(status.progress, 0);
    assert_eq!(core.ha_role().await, HaRole::Active);
    assert!(core.begin_request().await.is_ok());

    // Further shares are accepted and ignored.
    assert!(core.unseal(&init.secret_shares[0]).await.unwrap());
    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn repeated_share_does_not_advance() {
    let (_storage, core, init) = initialized(5, 3).await;
    for _ in 0..4 {
        assert!(!core.unseal(&init.secret_shares[0]).await.unwrap());
    }
    assert_eq!(core.secret_progress().await.0, 1);
    assert!(core.sealed());
}

#[tokio::test]
async fn share_length_is_checked() {
    let (_storage, core, init) = initialized(3, 2).await;
    let short = &init.secret_shares[0][..10];
    let mut long = init.secret_shares[0].clone();
    long.extend_from_slice(&[0u8; 8]);

    assert!(matches!(core.unseal(short).await, Err(CoreError::InvalidKey { .. })));
    assert!(matches!(core.unseal(&long).await, Err(CoreError::InvalidKey { .. })));
    assert_eq!(core.secret_progress().await.0, 0);
}

#[tokio::test]
async fn session_restarts_after_reseal() {
    let (_storage, core, init) = initialized(3, 2).await;
    assert!(!core.unseal(&init.secret_shares[0]).await.unwrap());
    assert!(core.unseal(&init.secret_shares[1]).await.unwrap());
    core.seal().await.unwrap();

    // The shares used last time must be presented again.
    assert!(!core.unseal(&init.secret_shares[1]).await.unwrap());
    assert!(core.unseal(&init.secret_shares[2]).await.unwrap());
    core.shutdown().await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn any_threshold_subset_unseals(picks in proptest::sample::subsequence(vec![0usize, 1, 2, 3, 4], 3)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let unsealed = runtime.block_on(async {
            let (_storage, core, init) = initialized(5, 3).await;
            let mut last = false;
            for index in &picks {
                last = core.unseal(&init.secret_shares[*index]).await.unwrap();
            }
            core.shutdown().await.unwrap();
            last
        });
        prop_assert!(unsealed);
    }
}

// ── Sealing ──────────────────────────────────────────────────────────

#[tokio::test]
async fn seal_waits_for_requests_then_cancels_them() {
    let storage = MemoryBackend::new();
    let mut config = CoreConfig::new(Arc::new(storage));
    config.max_request_duration = Duration::from_millis(50);
    let core = Core::new(config).await.unwrap();
    let init = core.initialize(shamir(1, 1)).await.unwrap();
    core.unseal(&init.secret_shares[0]).await.unwrap();

    let guard = core.begin_request().await.unwrap();
    assert!(!guard.is_cancelled());

    let sealer = tokio::spawn({
        let core = core.clone();
        async move { core.seal().await }
    });

    tokio::time::timeout(Duration::from_secs(5), guard.cancelled())
        .await
        .expect("request was never cancelled");
    assert!(core.sealed());
    assert!(matches!(core.begin_request().await, Err(CoreError::Sealed)));
    drop(guard);

    sealer.await.unwrap().unwrap();
    assert!(core.sealed());
}

#[tokio::test]
async fn requests_started_before_seal_see_cancellation() {
    let (_storage, core, init) = initialized(1, 1).await;
    core.unseal(&init.secret_shares[0]).await.unwrap();

    let guard = core.begin_request().await.unwrap();
    let token = guard.token().clone();
    drop(guard);
    core.seal().await.unwrap();
    assert!(token.is_cancelled());
}

// ── Activation failure ───────────────────────────────────────────────

struct Refuse;

#[async_trait]
impl ActivationHook for Refuse {
    async fn on_activation(&self) -> Result<(), CoreError> {
        Err(CoreError::Internal)
    }
}

#[tokio::test]
async fn failed_activation_leaves_node_sealed() {
    let storage = MemoryBackend::new();
    let mut config = CoreConfig::new(Arc::new(storage));
    config.collaborators = Collaborators {
        on_activation: vec![Arc::new(Refuse)],
        ..Collaborators::default()
    };
    let core = Core::new(config).await.unwrap();
    let init = core.initialize(shamir(1, 1)).await.unwrap();

    assert!(core.unseal(&init.secret_shares[0]).await.is_err());
    assert!(core.sealed());
    assert!(matches!(core.begin_request().await, Err(CoreError::Sealed)));
    assert_eq!(core.secret_progress().await.0, 0);
}

// ── Auto seal ────────────────────────────────────────────────────────

#[tokio::test]
async fn auto_seal_restarts_unattended() {
    let storage = MemoryBackend::new();
    let mut config = CoreConfig::new(Arc::new(storage.clone()));
    config.seal = Some(auto_seal(&storage));
    let first = Core::new(config.clone()).await.unwrap();
    let init = first
        .initialize(InitParams {
            barrier: SealConfig::new("static", 1, 1, 1),
            recovery: Some(SealConfig::new(SHAMIR_SEAL_TYPE, 5, 3, 0)),
        })
        .await
        .unwrap();
    assert_eq!(init.recovery_shares.len(), 5);
    first.unseal_with_stored_keys().await.unwrap();
    first.shutdown().await.unwrap();

    config.seal = Some(auto_seal(&storage));
    let second = Core::new(config).await.unwrap();
    second.unseal_with_stored_keys().await.unwrap();
    assert!(!second.sealed());
    assert_eq!(second.ha_role().await, HaRole::Active);
    second.shutdown().await.unwrap();

    // Recovery shares can still be used by hand.
    assert!(!second.unseal(&init.recovery_shares[0]).await.unwrap());
    assert!(!second.unseal(&init.recovery_shares[3]).await.unwrap());
    assert!(second.unseal(&init.recovery_shares[4]).await.unwrap());
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn auto_unseal_failure_is_non_fatal() {
    let storage = MemoryBackend::new();
    let mut config = CoreConfig::new(Arc::new(storage.clone()));
    config.seal = Some(auto_seal(&storage));
    let core = Core::new(config).await.unwrap();
    core.initialize(InitParams {
        barrier: SealConfig::new("static", 1, 1, 1),
        recovery: Some(SealConfig::new(SHAMIR_SEAL_TYPE, 1, 1, 0)),
    })
    .await
    .unwrap();

    storage.set_unavailable(true);
    let err = core.unseal_with_stored_keys().await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(core.sealed());
}

// ── Persistent storage ───────────────────────────────────────────────

#[tokio::test]
async fn rocksdb_node_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let shares = {
        let storage: Arc<dyn StorageBackend> = Arc::new(RocksDbBackend::open(dir.path()).unwrap());
        let core = Core::new(CoreConfig::new(storage)).await.unwrap();
        let init = core.initialize(shamir(3, 2)).await.unwrap();
        init.secret_shares.clone()
    };

    let storage: Arc<dyn StorageBackend> = Arc::new(RocksDbBackend::open(dir.path()).unwrap());
    let core = Core::new(CoreConfig::new(storage)).await.unwrap();
    assert!(core.initialized().await.unwrap());
    assert!(!core.unseal(&shares[0]).await.unwrap());
    assert!(core.unseal(&shares[2]).await.unwrap());
    core.shutdown().await.unwrap();
}

// ── Cluster join ─────────────────────────────────────────────────────

#[tokio::test]
async fn joining_node_unseals_once_data_arrives() {
    let (leader_storage, leader, init) = initialized(3, 2).await;
    assert!(leader.unseal(&init.secret_shares[0]).await.is_ok());
    assert!(leader.unseal(&init.secret_shares[1]).await.unwrap());

    let follower_storage = MemoryBackend::new();
    let follower = node(&follower_storage).await;
    let (ready_tx, ready_rx) = watch::channel(false);
    follower
        .begin_cluster_join(ClusterJoin {
            leader_barrier_config: SealConfig::new(SHAMIR_SEAL_TYPE, 3, 2, 1),
            ready: ready_rx,
        })
        .await
        .unwrap();

    assert!(!follower.unseal(&init.secret_shares[1]).await.unwrap());
    assert!(!follower.unseal(&init.secret_shares[2]).await.unwrap());
    assert!(follower.sealed());

    replicate(&leader_storage, &follower_storage).await;
    ready_tx.send(true).unwrap();

    assert!(becomes_unsealed(&follower).await);
    assert_eq!(follower.ha_role().await, HaRole::Active);
    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}

#[tokio::test]
async fn initialized_node_cannot_join() {
    let (_storage, core, _init) = initialized(1, 1).await;
    let (_tx, ready) = watch::channel(false);
    let err = core
        .begin_cluster_join(ClusterJoin {
            leader_barrier_config: SealConfig::new(SHAMIR_SEAL_TYPE, 1, 1, 1),
            ready,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyInitialized));
}
