//! Read-through cache in front of a storage backend.
//!
//! The cache starts disabled. The core enables it once the barrier is
//! unsealed and purges it on every activation, so entries never outlive a
//! seal/unseal cycle. It only ever holds what the backend holds, which is
//! ciphertext for everything written through the barrier.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::{StorageBackend, StorageError};

/// Entries kept when no capacity is given.
pub const DEFAULT_CACHE_SIZE: usize = 131_072;

/// Cached values with least-recently-used eviction.
struct Entries {
    capacity: usize,
    tick: u64,
    values: HashMap<String, (Option<Vec<u8>>, u64)>,
    recency: BTreeMap<u64, String>,
}

impl Entries {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            values: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    fn get(&mut self, key: &str) -> Option<Option<Vec<u8>>> {
        let tick = self.next_tick();
        let (value, used) = self.values.get_mut(key)?;
        self.recency.remove(used);
        *used = tick;
        self.recency.insert(tick, key.to_owned());
        Some(value.clone())
    }

    fn insert(&mut self, key: &str, value: Option<Vec<u8>>) {
        self.remove(key);
        while self.values.len() >= self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.values.remove(&oldest);
        }
        let tick = self.next_tick();
        self.recency.insert(tick, key.to_owned());
        self.values.insert(key.to_owned(), (value, tick));
    }

    fn remove(&mut self, key: &str) {
        if let Some((_, used)) = self.values.remove(key) {
            self.recency.remove(&used);
        }
    }

    fn clear(&mut self) {
        self.values.clear();
        self.recency.clear();
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// A caching wrapper around another [`StorageBackend`], holding at most a
/// fixed number of entries.
pub struct CacheLayer {
    inner: Arc<dyn StorageBackend>,
    enabled: AtomicBool,
    entries: Mutex<Entries>,
}

impl CacheLayer {
    /// Wrap `inner` with room for [`DEFAULT_CACHE_SIZE`] entries. The cache
    /// is disabled until [`set_enabled`](Self::set_enabled).
    #[must_use]
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_SIZE)
    }

    /// Wrap `inner`, keeping at most `capacity` entries (at least one).
    #[must_use]
    pub fn with_capacity(inner: Arc<dyn StorageBackend>, capacity: usize) -> Self {
        Self {
            inner,
            enabled: AtomicBool::new(false),
            entries: Mutex::new(Entries::new(capacity)),
        }
    }

    /// Turn caching on or off. Disabling also purges.
    pub async fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.purge().await;
        }
    }

    /// Whether reads are currently served from the cache.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Drop every cached entry.
    pub async fn purge(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Borrow the wrapped backend, bypassing the cache.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }
}

#[async_trait::async_trait]
impl StorageBackend for CacheLayer {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if !self.is_enabled() {
            return self.inner.get(key).await;
        }
        if let Some(hit) = self.entries.lock().await.get(key) {
            return Ok(hit);
        }
        let value = self.inner.get(key).await?;
        if self.is_enabled() {
            self.entries.lock().await.insert(key, value.clone());
        }
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        // Invalidate first so a failed write never leaves a stale hit.
        self.entries.lock().await.remove(key);
        self.inner.put(key, value).await?;
        if self.is_enabled() {
            self.entries.lock().await.insert(key, Some(value.to_vec()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().await.remove(key);
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
