//! Background workers that live as long as the node is active.
//!
//! Every worker gets the active-service token and only the handles it needs,
//! never the coordinator itself, so none of them can touch the state lock.

use std::sync::Arc;
use std::time::Duration;

use strongroom_storage::CacheLayer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::barrier::{Barrier, RotationPolicy};
use crate::error::{BarrierError, CoreError};
use crate::subsystem::PeriodicTask;

/// Maximum retry attempts for a failed tick before giving up until the next one.
const TICK_MAX_RETRIES: u32 = 3;

/// Consecutive failed ticks after which failures are logged as errors.
const PERSISTENT_FAILURE_THRESHOLD: u32 = 5;

/// Run a collaborator's periodic task until `token` is cancelled.
pub(super) async fn periodic_worker(task: Arc<dyn PeriodicTask>, token: CancellationToken) {
    let mut interval = tokio::time::interval(task.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;
    debug!(task = task.name(), "periodic task started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match retry_tick(task.as_ref(), &token).await {
                    Ok(false) => break,
                    Ok(true) => consecutive_failures = 0,
                    Err(last_err) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= PERSISTENT_FAILURE_THRESHOLD {
                            error!(
                                task = task.name(),
                                error = %last_err,
                                consecutive_failures,
                                "periodic task persistently failing, storage may be down"
                            );
                        } else {
                            warn!(
                                task = task.name(),
                                error = %last_err,
                                consecutive_failures,
                                "periodic task failed, will retry next tick"
                            );
                        }
                    }
                }
            }
            () = token.cancelled() => break,
        }
    }
    debug!(task = task.name(), "periodic task stopped");
}

/// Run one tick, retrying storage failures with backoff (1s, 2s, 4s).
///
/// Returns `Ok(false)` if cancelled while waiting to retry.
async fn retry_tick(task: &dyn PeriodicTask, token: &CancellationToken) -> Result<bool, CoreError> {
    let mut attempt: u32 = 0;
    loop {
        let err = match task.tick().await {
            Ok(()) => return Ok(true),
            Err(e) => e,
        };
        if attempt == TICK_MAX_RETRIES || !is_transient(&err) {
            return Err(err);
        }

        let backoff = Duration::from_secs(1u64 << attempt);
        attempt = attempt.saturating_add(1);
        debug!(
            task = task.name(),
            attempt,
            max = TICK_MAX_RETRIES.saturating_add(1),
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "periodic task failed, retrying"
        );

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = token.cancelled() => return Ok(false),
        }
    }
}

fn is_transient(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Storage(_) | CoreError::Barrier(BarrierError::Storage(_))
    )
}

/// Periodically ask the barrier whether its key term is due for rotation.
pub(super) async fn rotation_worker(
    barrier: Arc<Barrier>,
    policy: RotationPolicy,
    every: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = token.cancelled() => return,
        }
        match barrier.check_auto_rotate(&policy).await {
            Ok(None) => {}
            Ok(Some(reason)) => match barrier.rotate().await {
                Ok(term) => info!(term, reason = %reason, "automatic key rotation"),
                Err(e) => warn!(error = %e, reason = %reason, "automatic key rotation failed"),
            },
            Err(BarrierError::Sealed) => return,
            Err(e) => warn!(error = %e, "key rotation check failed"),
        }
    }
}

/// Emit core gauges as structured log events.
pub(super) async fn metrics_worker(
    barrier: Arc<Barrier>,
    cache: Arc<CacheLayer>,
    every: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = token.cancelled() => return,
        }
        let term = barrier.active_term().await;
        debug!(
            target: "strongroom::metrics",
            unsealed = term.is_some(),
            active = true,
            key_term = term.unwrap_or_default(),
            cache_enabled = cache.is_enabled(),
            "core metrics"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use strongroom_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::crypto::EncryptionKey;

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        transient: bool,
    }

    #[async_trait::async_trait]
    impl PeriodicTask for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn tick(&self) -> Result<(), CoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                if self.transient {
                    return Err(CoreError::Storage(strongroom_storage::StorageError::Read {
                        key: "x".to_owned(),
                        reason: "unavailable".to_owned(),
                    }));
                }
                return Err(CoreError::Internal);
            }
            Ok(())
        }
    }

    // ── retry ──

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let task = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
            transient: true,
        };
        let token = CancellationToken::new();
        assert!(retry_tick(&task, &token).await.unwrap());
        assert_eq!(task.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let task = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 100,
            transient: true,
        };
        let token = CancellationToken::new();
        assert!(retry_tick(&task, &token).await.is_err());
        assert_eq!(task.calls.load(Ordering::SeqCst), TICK_MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn non_transient_failures_are_not_retried() {
        let task = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
            transient: false,
        };
        let token = CancellationToken::new();
        assert!(matches!(retry_tick(&task, &token).await, Err(CoreError::Internal)));
        assert_eq!(task.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let task = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 100,
            transient: true,
        };
        let token = CancellationToken::new();
        token.cancel();
        assert!(!retry_tick(&task, &token).await.unwrap());
    }

    // ── rotation ──

    #[tokio::test]
    async fn rotation_worker_rotates_when_due() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        let root = EncryptionKey::generate();
        barrier.initialize(&root).await.unwrap();
        barrier.unseal(&root).await.unwrap();
        let before = barrier.active_term().await.unwrap();

        let policy = RotationPolicy {
            max_operations: 0,
            interval: None,
        };
        let token = CancellationToken::new();
        let worker = tokio::spawn(rotation_worker(
            Arc::clone(&barrier),
            policy,
            Duration::from_millis(10),
            token.clone(),
        ));

        for _ in 0..100 {
            if barrier.active_term().await.unwrap() > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        worker.await.unwrap();
        assert!(barrier.active_term().await.unwrap() > before);
    }

    // ── metrics ──

    #[tokio::test]
    async fn metrics_worker_reports_until_cancelled() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let cache = Arc::new(CacheLayer::new(Arc::clone(&storage)));
        let barrier = Arc::new(Barrier::new(Arc::clone(&cache) as Arc<dyn StorageBackend>));
        let root = EncryptionKey::generate();
        barrier.initialize(&root).await.unwrap();
        barrier.unseal(&root).await.unwrap();

        let token = CancellationToken::new();
        let worker = tokio::spawn(metrics_worker(
            barrier,
            cache,
            Duration::from_millis(5),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!worker.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
