//! In-memory storage backends for tests and dev mode.
//!
//! [`MemoryBackend`] keeps all data in a `BTreeMap` behind a `RwLock`; clones
//! share the same map, which lets several nodes in one test process "share"
//! a storage cluster. [`MemoryHaBackend`] adds an in-process leadership lock
//! with the same sharing semantics.
//!
//! Nothing here is persistent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{HaBackend, HaLock, StorageBackend, StorageError};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Data is sorted by key, so prefix listing is a range scan.
///
/// # Examples
///
/// ```
/// # use strongroom_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.put("core/seal-config", b"{}").await.unwrap();
/// let val = backend.get("core/seal-config").await.unwrap();
/// assert_eq!(val, Some(b"{}".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every operation fails with
    /// [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the backend holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "memory backend marked unavailable".to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }
}

#[derive(Debug)]
struct HeldLock {
    owner: u64,
    value: String,
    lost: CancellationToken,
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashMap<String, HeldLock>>,
    released: Notify,
    next_id: AtomicU64,
}

/// In-process leadership locks. Clones share the lock table, so every
/// `Core` built from a clone contends for the same locks.
#[derive(Debug, Clone, Default)]
pub struct MemoryHaBackend {
    table: Arc<LockTable>,
}

impl MemoryHaBackend {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forcibly take `key` away from its holder, as a storage-side session
    /// expiry would. The holder observes this through its lost-lock token.
    pub async fn break_lock(&self, key: &str) {
        let removed = self.table.held.lock().await.remove(key);
        if let Some(held) = removed {
            tracing::debug!(key, owner = held.owner, "ha lock broken");
            held.lost.cancel();
        }
        self.table.released.notify_waiters();
    }
}

impl HaBackend for MemoryHaBackend {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn HaLock>, StorageError> {
        let id = self.table.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryHaLock {
            table: Arc::clone(&self.table),
            key: key.to_owned(),
            value: value.to_owned(),
            id,
        }))
    }
}

struct MemoryHaLock {
    table: Arc<LockTable>,
    key: String,
    value: String,
    id: u64,
}

#[async_trait::async_trait]
impl HaLock for MemoryHaLock {
    async fn lock(
        &self,
        stop: CancellationToken,
    ) -> Result<Option<CancellationToken>, StorageError> {
        loop {
            let released = self.table.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut held = self.table.held.lock().await;
                match held.get(&self.key) {
                    Some(current) if current.owner == self.id => {
                        return Ok(Some(current.lost.clone()));
                    }
                    Some(_) => {}
                    None => {
                        let lost = CancellationToken::new();
                        held.insert(
                            self.key.clone(),
                            HeldLock {
                                owner: self.id,
                                value: self.value.clone(),
                                lost: lost.clone(),
                            },
                        );
                        return Ok(Some(lost));
                    }
                }
            }

            tokio::select! {
                () = &mut released => {}
                () = stop.cancelled() => return Ok(None),
            }
        }
    }

    async fn unlock(&self) -> Result<(), StorageError> {
        let mut held = self.table.held.lock().await;
        if held.get(&self.key).is_some_and(|h| h.owner == self.id) {
            held.remove(&self.key);
            drop(held);
            self.table.released.notify_waiters();
        }
        Ok(())
    }

    async fn value(&self) -> Result<Option<String>, StorageError> {
        let held = self.table.held.lock().await;
        Ok(held.get(&self.key).map(|h| h.value.clone()))
    }
}
