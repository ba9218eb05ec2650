//! Physical storage layer for `Strongroom`.
//!
//! This crate defines the [`StorageBackend`] trait, a key-value interface
//! that knows nothing about secrets or encryption. The barrier in
//! `strongroom-core` wraps a backend so only ciphertext ever reaches this
//! layer. Backends are treated as untrusted and possibly unavailable.
//!
//! Leadership for highly-available deployments is exposed separately through
//! [`HaBackend`] and [`HaLock`], since not every backend can coordinate
//! multiple nodes.
//!
//! Provided implementations:
//!
//! - [`RocksDbBackend`]: persistent, single node (feature `rocksdb-backend`)
//! - [`MemoryBackend`]: in-memory, for tests and dev mode
//! - [`MemoryHaBackend`]: in-process leadership lock shared by clones
//! - [`CacheLayer`]: bounded read-through cache in front of any backend

mod cache;
mod error;
mod memory;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use cache::{CacheLayer, DEFAULT_CACHE_SIZE};
pub use error::StorageError;
pub use memory::{MemoryBackend, MemoryHaBackend};
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

use tokio_util::sync::CancellationToken;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `core/seal-config`).
/// Values are opaque byte arrays.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Deleting a non-existent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in sorted order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// A backend able to coordinate leadership between several nodes.
pub trait HaBackend: Send + Sync + 'static {
    /// Whether this backend is actually configured for HA.
    fn ha_enabled(&self) -> bool {
        true
    }

    /// Create a lock handle for `key`. `value` is published to other nodes
    /// while the lock is held (typically the holder's advertised address).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the handle cannot be created.
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn HaLock>, StorageError>;
}

/// A leadership lock handle.
#[async_trait::async_trait]
pub trait HaLock: Send + Sync {
    /// Block until the lock is acquired or `stop` is cancelled.
    ///
    /// Returns `Ok(None)` when stopped before acquisition. On success returns
    /// a token that is cancelled if the lock is later lost involuntarily.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend fails while contending.
    async fn lock(&self, stop: CancellationToken)
    -> Result<Option<CancellationToken>, StorageError>;

    /// Release the lock if this handle holds it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend fails.
    async fn unlock(&self) -> Result<(), StorageError>;

    /// The value published by the current holder, if any node holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend fails.
    async fn value(&self) -> Result<Option<String>, StorageError>;
}
