//! Encryption barrier for `Strongroom`.
//!
//! Every logical value passes through the barrier's encrypt/decrypt before
//! touching the storage backend; the backend only ever sees ciphertext.
//!
//! # Key hierarchy
//!
//! - The **root key** is held in memory only while unsealed. It encrypts
//!   nothing but the keyring.
//! - The **keyring** (`core/keyring`) holds numbered key terms. Values are
//!   encrypted under the active term and tagged with its number, so older
//!   terms keep decrypting after a [`rotate`](Barrier::rotate).
//! - [`rekey`](Barrier::rekey) swaps the root key by re-encrypting the
//!   keyring alone; no data is rewritten.
//!
//! Value format: `term (u32 BE) || nonce || ciphertext || tag`, with the
//! storage path as associated data.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongroom_storage::StorageBackend;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::crypto::{self, EncryptionKey, KEY_LEN};
use crate::error::BarrierError;

/// Physical path of the encrypted keyring.
pub const KEYRING_PATH: &str = "core/keyring";

/// Logical path rewritten on every rotation so replicated clusters can
/// detect that the keyring changed.
pub const KEYRING_CANARY_PATH: &str = "core/canary-keyring";

const TERM_HEADER_LEN: usize = 4;

/// Default number of encryptions under one term before rotation is due.
pub const DEFAULT_MAX_OPERATIONS: u64 = 3_865_470_566;

/// When the active key term should be rotated automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once this many values have been encrypted under the active term.
    pub max_operations: u64,
    /// Rotate once the active term is older than this.
    pub interval: Option<Duration>,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            interval: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyringRecord {
    active_term: u32,
    terms: Vec<TermRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TermRecord {
    term: u32,
    key: String,
    installed_at: DateTime<Utc>,
}

struct TermKey {
    key: EncryptionKey,
    installed_at: DateTime<Utc>,
}

struct Keyring {
    root: EncryptionKey,
    terms: BTreeMap<u32, TermKey>,
    active_term: u32,
}

impl Keyring {
    fn fresh(root: EncryptionKey) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(
            1,
            TermKey {
                key: EncryptionKey::generate(),
                installed_at: Utc::now(),
            },
        );
        Self {
            root,
            terms,
            active_term: 1,
        }
    }

    fn active(&self) -> Result<(u32, &TermKey), BarrierError> {
        self.terms
            .get(&self.active_term)
            .map(|k| (self.active_term, k))
            .ok_or(BarrierError::UnknownTerm {
                term: self.active_term,
            })
    }

    fn seal_record(&self) -> Result<Vec<u8>, BarrierError> {
        let record = KeyringRecord {
            active_term: self.active_term,
            terms: self
                .terms
                .iter()
                .map(|(term, k)| TermRecord {
                    term: *term,
                    key: BASE64.encode(k.key.as_bytes()),
                    installed_at: k.installed_at,
                })
                .collect(),
        };
        let plain = zeroize::Zeroizing::new(serde_json::to_vec(&record).map_err(|e| {
            BarrierError::Corrupt {
                key: KEYRING_PATH.to_owned(),
                reason: e.to_string(),
            }
        })?);
        Ok(crypto::encrypt_with_aad(
            &self.root,
            &plain,
            KEYRING_PATH.as_bytes(),
        )?)
    }

    fn open_record(root: EncryptionKey, blob: &[u8]) -> Result<Self, BarrierError> {
        let plain = zeroize::Zeroizing::new(
            crypto::decrypt_with_aad(&root, blob, KEYRING_PATH.as_bytes()).map_err(|e| {
                BarrierError::Decrypt {
                    reason: e.to_string(),
                }
            })?,
        );
        let record: KeyringRecord =
            serde_json::from_slice(&plain).map_err(|e| corrupt_keyring(e.to_string()))?;

        let mut terms = BTreeMap::new();
        for t in record.terms {
            let raw = zeroize::Zeroizing::new(
                BASE64
                    .decode(&t.key)
                    .map_err(|e| corrupt_keyring(e.to_string()))?,
            );
            let key = EncryptionKey::from_slice(&raw)?;
            terms.insert(
                t.term,
                TermKey {
                    key,
                    installed_at: t.installed_at,
                },
            );
        }
        if !terms.contains_key(&record.active_term) {
            return Err(corrupt_keyring(format!(
                "active term {} missing",
                record.active_term
            )));
        }
        Ok(Self {
            root,
            terms,
            active_term: record.active_term,
        })
    }
}

fn corrupt_keyring(reason: String) -> BarrierError {
    BarrierError::Corrupt {
        key: KEYRING_PATH.to_owned(),
        reason,
    }
}

/// The encryption barrier wrapping a storage backend.
///
/// All reads decrypt, all writes encrypt. When sealed, logical operations
/// return [`BarrierError::Sealed`].
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    keyring: RwLock<Option<Keyring>>,
    operations: AtomicU64,
}

impl Barrier {
    /// Create a new sealed barrier wrapping the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            keyring: RwLock::new(None),
            operations: AtomicU64::new(0),
        }
    }

    /// Minimum and maximum accepted root key length, in bytes.
    #[must_use]
    pub fn key_length(&self) -> (usize, usize) {
        (KEY_LEN, KEY_LEN)
    }

    /// Generate a fresh root key.
    #[must_use]
    pub fn generate_key(&self) -> EncryptionKey {
        EncryptionKey::generate()
    }

    /// Whether a keyring has been written.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn initialized(&self) -> Result<bool, BarrierError> {
        Ok(self.storage.exists(KEYRING_PATH).await?)
    }

    /// Write a new keyring protected by `root_key`. Leaves the barrier sealed.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::AlreadyInitialized`] if a keyring exists.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn initialize(&self, root_key: &EncryptionKey) -> Result<(), BarrierError> {
        if self.initialized().await? {
            return Err(BarrierError::AlreadyInitialized);
        }
        let keyring = Keyring::fresh(root_key.clone());
        self.storage
            .put(KEYRING_PATH, &keyring.seal_record()?)
            .await?;
        info!("barrier keyring initialized");
        Ok(())
    }

    /// Unseal the barrier with the root key.
    ///
    /// Idempotent while already unsealed.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::NotInitialized`] if there is no keyring.
    /// - [`BarrierError::Decrypt`] if `root_key` does not open the keyring.
    pub async fn unseal(&self, root_key: &EncryptionKey) -> Result<(), BarrierError> {
        let mut guard = self.keyring.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let blob = self
            .storage
            .get(KEYRING_PATH)
            .await?
            .ok_or(BarrierError::NotInitialized)?;
        let keyring = Keyring::open_record(root_key.clone(), &blob)?;
        debug!(active_term = keyring.active_term, "barrier keyring loaded");
        *guard = Some(keyring);
        self.operations.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Seal the barrier, dropping (and zeroizing) all key material.
    pub async fn seal(&self) {
        let mut guard = self.keyring.write().await;
        *guard = None;
    }

    /// Whether the barrier is sealed.
    pub async fn is_sealed(&self) -> bool {
        self.keyring.read().await.is_none()
    }

    /// The root key currently protecting the keyring.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] if sealed.
    pub(crate) async fn root_key(&self) -> Result<EncryptionKey, BarrierError> {
        let guard = self.keyring.read().await;
        guard
            .as_ref()
            .map(|k| k.root.clone())
            .ok_or(BarrierError::Sealed)
    }

    /// Replace the root key, re-encrypting the keyring under `new_root`.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if persisting the keyring fails; the
    ///   previous root key stays in effect.
    pub async fn rekey(&self, new_root: &EncryptionKey) -> Result<(), BarrierError> {
        let mut guard = self.keyring.write().await;
        let keyring = guard.as_mut().ok_or(BarrierError::Sealed)?;
        let previous = std::mem::replace(&mut keyring.root, new_root.clone());
        let persisted = match keyring.seal_record() {
            Ok(blob) => self.storage.put(KEYRING_PATH, &blob).await.map_err(Into::into),
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            keyring.root = previous;
            return Err(e);
        }
        info!("barrier root key replaced");
        Ok(())
    }

    /// Install a new key term and make it active. Returns the new term.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if persisting the keyring fails.
    pub async fn rotate(&self) -> Result<u32, BarrierError> {
        let mut guard = self.keyring.write().await;
        let keyring = guard.as_mut().ok_or(BarrierError::Sealed)?;
        let previous = keyring.active_term;
        let term = previous.saturating_add(1);
        keyring.terms.insert(
            term,
            TermKey {
                key: EncryptionKey::generate(),
                installed_at: Utc::now(),
            },
        );
        keyring.active_term = term;
        let persisted = match keyring.seal_record() {
            Ok(blob) => self.storage.put(KEYRING_PATH, &blob).await.map_err(Into::into),
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            keyring.terms.remove(&term);
            keyring.active_term = previous;
            return Err(e);
        }
        self.operations.store(0, Ordering::SeqCst);
        drop(guard);

        self.put(KEYRING_CANARY_PATH, term.to_string().as_bytes())
            .await?;
        info!(term, "barrier key rotated");
        Ok(term)
    }

    /// The active key term, or `None` while sealed.
    pub async fn active_term(&self) -> Option<u32> {
        self.keyring.read().await.as_ref().map(|k| k.active_term)
    }

    /// Decide whether the active term is due for rotation under `policy`.
    /// Returns the reason when it is.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] if sealed.
    pub async fn check_auto_rotate(
        &self,
        policy: &RotationPolicy,
    ) -> Result<Option<String>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        let (_, active) = keyring.active()?;

        let ops = self.operations.load(Ordering::SeqCst);
        if ops >= policy.max_operations {
            return Ok(Some(format!(
                "reached max operations ({ops} >= {})",
                policy.max_operations
            )));
        }
        if let Some(interval) = policy.interval {
            let age = Utc::now()
                .signed_duration_since(active.installed_at)
                .to_std()
                .unwrap_or_default();
            if age >= interval {
                return Ok(Some(format!("rotation interval of {interval:?} elapsed")));
            }
        }
        Ok(None)
    }

    /// Read a value, decrypting it through the barrier.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::UnknownTerm`] or [`BarrierError::Crypto`] if the
    ///   stored value cannot be decrypted.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;

        let Some(blob) = self.storage.get(key).await? else {
            return Ok(None);
        };
        if blob.len() < TERM_HEADER_LEN {
            return Err(BarrierError::Corrupt {
                key: key.to_owned(),
                reason: "value shorter than term header".to_owned(),
            });
        }
        let (header, sealed) = blob.split_at(TERM_HEADER_LEN);
        let mut term_bytes = [0u8; TERM_HEADER_LEN];
        term_bytes.copy_from_slice(header);
        let term = u32::from_be_bytes(term_bytes);
        let term_key = keyring
            .terms
            .get(&term)
            .ok_or(BarrierError::UnknownTerm { term })?;
        let plain = crypto::decrypt_with_aad(&term_key.key, sealed, key.as_bytes())?;
        Ok(Some(plain))
    }

    /// Write a value, encrypting it under the active term.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        let (term, term_key) = keyring.active()?;

        let sealed = crypto::encrypt_with_aad(&term_key.key, value, key.as_bytes())?;
        let mut blob = Vec::with_capacity(TERM_HEADER_LEN.saturating_add(sealed.len()));
        blob.extend_from_slice(&term.to_be_bytes());
        blob.extend_from_slice(&sealed);
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.storage.put(key, &blob).await?;
        Ok(())
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.ensure_unsealed().await?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys with the given prefix. Paths are stored in plaintext, so
    /// listing needs no decryption.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.exists(key).await?)
    }

    async fn ensure_unsealed(&self) -> Result<(), BarrierError> {
        if self.keyring.read().await.is_none() {
            return Err(BarrierError::Sealed);
        }
        Ok(())
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("operations", &self.operations.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use strongroom_storage::MemoryBackend;

    use super::*;

    async fn unsealed_barrier() -> (MemoryBackend, Barrier, EncryptionKey) {
        let storage = MemoryBackend::new();
        let barrier = Barrier::new(Arc::new(storage.clone()));
        let root = barrier.generate_key();
        barrier.initialize(&root).await.unwrap();
        barrier.unseal(&root).await.unwrap();
        (storage, barrier, root)
    }

    #[tokio::test]
    async fn sealed_barrier_rejects_logical_operations() {
        let barrier = Barrier::new(Arc::new(MemoryBackend::new()));
        assert!(matches!(barrier.get("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.put("k", b"v").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.delete("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.list("").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.exists("k").await, Err(BarrierError::Sealed)));
    }

    #[tokio::test]
    async fn unseal_without_keyring_is_not_initialized() {
        let barrier = Barrier::new(Arc::new(MemoryBackend::new()));
        let err = barrier.unseal(&EncryptionKey::generate()).await.unwrap_err();
        assert!(matches!(err, BarrierError::NotInitialized));
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let (_, barrier, root) = unsealed_barrier().await;
        assert!(matches!(
            barrier.initialize(&root).await,
            Err(BarrierError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn wrong_root_key_is_decrypt_error() {
        let (_, barrier, _) = unsealed_barrier().await;
        barrier.seal().await;
        let err = barrier.unseal(&EncryptionKey::generate()).await.unwrap_err();
        assert!(matches!(err, BarrierError::Decrypt { .. }));
        assert!(barrier.is_sealed().await);
    }

    #[tokio::test]
    async fn storage_never_sees_plaintext() {
        let (storage, barrier, _) = unsealed_barrier().await;
        barrier.put("secret/app", b"hunter2hunter2").await.unwrap();
        let raw = storage.get("secret/app").await.unwrap().unwrap();
        assert!(!raw.windows(14).any(|w| w == b"hunter2hunter2"));
        assert_eq!(
            barrier.get("secret/app").await.unwrap(),
            Some(b"hunter2hunter2".to_vec())
        );
    }

    #[tokio::test]
    async fn value_moved_to_other_path_fails_authentication() {
        let (storage, barrier, _) = unsealed_barrier().await;
        barrier.put("a", b"value").await.unwrap();
        let raw = storage.get("a").await.unwrap().unwrap();
        storage.put("b", &raw).await.unwrap();
        assert!(matches!(barrier.get("b").await, Err(BarrierError::Crypto(_))));
    }

    #[tokio::test]
    async fn rotate_keeps_old_terms_readable() {
        let (_, barrier, root) = unsealed_barrier().await;
        barrier.put("old", b"1").await.unwrap();
        assert_eq!(barrier.rotate().await.unwrap(), 2);
        barrier.put("new", b"2").await.unwrap();
        assert_eq!(
            barrier.get(KEYRING_CANARY_PATH).await.unwrap(),
            Some(b"2".to_vec())
        );

        barrier.seal().await;
        barrier.unseal(&root).await.unwrap();
        assert_eq!(barrier.active_term().await, Some(2));
        assert_eq!(barrier.get("old").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(barrier.get("new").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn rekey_switches_root_and_preserves_data() {
        let (_, barrier, old_root) = unsealed_barrier().await;
        barrier.put("data", b"kept").await.unwrap();

        let new_root = barrier.generate_key();
        barrier.rekey(&new_root).await.unwrap();
        barrier.seal().await;

        assert!(barrier.unseal(&old_root).await.is_err());
        barrier.unseal(&new_root).await.unwrap();
        assert_eq!(barrier.get("data").await.unwrap(), Some(b"kept".to_vec()));
    }

    #[tokio::test]
    async fn failed_rekey_keeps_previous_root() {
        let (storage, barrier, old_root) = unsealed_barrier().await;
        storage.set_unavailable(true);
        assert!(barrier.rekey(&barrier.generate_key()).await.is_err());
        storage.set_unavailable(false);

        barrier.seal().await;
        barrier.unseal(&old_root).await.unwrap();
    }

    #[tokio::test]
    async fn auto_rotate_triggers_on_operation_count() {
        let (_, barrier, _) = unsealed_barrier().await;
        let policy = RotationPolicy {
            max_operations: 2,
            interval: None,
        };
        barrier.put("a", b"1").await.unwrap();
        assert_eq!(barrier.check_auto_rotate(&policy).await.unwrap(), None);
        barrier.put("b", b"2").await.unwrap();
        assert!(barrier.check_auto_rotate(&policy).await.unwrap().is_some());

        barrier.rotate().await.unwrap();
        // The canary write counts against the fresh term.
        let policy = RotationPolicy {
            max_operations: 3,
            interval: None,
        };
        assert_eq!(barrier.check_auto_rotate(&policy).await.unwrap(), None);
    }

    #[tokio::test]
    async fn auto_rotate_triggers_on_age() {
        let (_, barrier, _) = unsealed_barrier().await;
        let policy = RotationPolicy {
            max_operations: u64::MAX,
            interval: Some(Duration::ZERO),
        };
        assert!(barrier.check_auto_rotate(&policy).await.unwrap().is_some());
    }
}
