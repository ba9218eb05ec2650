//! Seals protect the barrier's root key.
//!
//! A [`Seal`] is the mechanism that turns operator input (or an external key
//! service) into the root key. Two variants exist:
//!
//! - [`ShamirSeal`]: the combined unseal key either *is* the root key
//!   (legacy) or is a key-encryption key for the stored root key.
//! - [`AutoSeal`]: the root key is wrapped by a [`KeyWrapper`]. A separate,
//!   operator-held recovery key authorizes privileged operations.
//!
//! Callers never inspect the concrete type: they ask
//! [`Seal::stored_keys_supported`] and [`Seal::recovery_key_supported`].
//!
//! # Security model
//!
//! - Seal configuration is plaintext metadata; it must be readable before the
//!   barrier is open.
//! - Stored keys and the recovery key are only ever persisted encrypted.
//! - A [`SealError::Decrypt`] from [`Seal::get_stored_keys`] means the current
//!   key cannot open what is stored. Migration detection relies on this.

mod auto;
mod config;
mod shamir;

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use strongroom_storage::StorageBackend;
use tokio::sync::RwLock;
use zeroize::{Zeroize, Zeroizing};

pub use auto::{AutoSeal, KeyWrapper, StaticKeyWrapper};
pub use config::{BARRIER_CONFIG_PATH, RECOVERY_CONFIG_PATH, SHAMIR_SEAL_TYPE, SealConfig};
pub use shamir::ShamirSeal;

use crate::crypto::EncryptionKey;
use crate::error::SealError;

/// Physical path of the stored (wrapped) root key.
pub const STORED_KEYS_PATH: &str = "core/hsm/barrier-unseal-keys";

/// Physical path of the wrapped recovery key.
pub const RECOVERY_KEY_PATH: &str = "core/recovery-key";

/// What a seal keeps in storage on the operator's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKeysSupport {
    /// The root key is stored, wrapped by an external mechanism.
    Generic,
    /// The root key is stored, encrypted by the combined Shamir key.
    ShamirRoot,
    /// Nothing is stored; the combined key is the root key.
    NotSupported,
}

/// The mechanism protecting the barrier's root key.
#[async_trait::async_trait]
pub trait Seal: Send + Sync + fmt::Debug {
    /// Type string recorded in [`SealConfig::seal_type`].
    fn barrier_type(&self) -> &str;

    /// Whether this seal has a recovery key.
    fn recovery_key_supported(&self) -> bool;

    /// How this seal stores the root key.
    async fn stored_keys_supported(&self) -> StoredKeysSupport;

    /// The persisted barrier config, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if the record cannot be read or decoded.
    async fn barrier_config(&self) -> Result<Option<SealConfig>, SealError>;

    /// Persist (or, with `None`, delete) the barrier config.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if validation or storage fails.
    async fn set_barrier_config(&self, config: Option<&SealConfig>) -> Result<(), SealError>;

    /// Replace the in-memory copy without touching storage. `None` forces
    /// the next read to go to storage.
    async fn set_cached_barrier_config(&self, config: Option<SealConfig>);

    /// The persisted recovery config, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Unsupported`] for seals without a recovery key.
    async fn recovery_config(&self) -> Result<Option<SealConfig>, SealError> {
        Err(self.unsupported("recovery config"))
    }

    /// Persist (or delete) the recovery config.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Unsupported`] for seals without a recovery key.
    async fn set_recovery_config(&self, _config: Option<&SealConfig>) -> Result<(), SealError> {
        Err(self.unsupported("recovery config"))
    }

    /// Replace the in-memory recovery config.
    async fn set_cached_recovery_config(&self, _config: Option<SealConfig>) {}

    /// Read the stored root key(s).
    ///
    /// # Errors
    ///
    /// - [`SealError::Decrypt`] if the stored keys cannot be unwrapped.
    /// - [`SealError::Unsupported`] for legacy Shamir seals.
    async fn get_stored_keys(&self) -> Result<Vec<EncryptionKey>, SealError>;

    /// Wrap and persist the root key(s).
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if wrapping or storage fails.
    async fn set_stored_keys(&self, keys: &[EncryptionKey]) -> Result<(), SealError>;

    /// The unwrapped recovery key.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Unsupported`] for seals without a recovery key.
    async fn recovery_key(&self) -> Result<Zeroizing<Vec<u8>>, SealError> {
        Err(self.unsupported("recovery keys"))
    }

    /// Wrap and persist a recovery key.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Unsupported`] for seals without a recovery key.
    async fn set_recovery_key(&self, _key: &[u8]) -> Result<(), SealError> {
        Err(self.unsupported("recovery keys"))
    }

    /// Check a candidate recovery key against the stored one.
    ///
    /// # Errors
    ///
    /// - [`SealError::RecoveryKeyMismatch`] if the key differs.
    /// - [`SealError::Unsupported`] for seals without a recovery key.
    async fn verify_recovery_key(&self, _key: &[u8]) -> Result<(), SealError> {
        Err(self.unsupported("recovery keys"))
    }

    /// Configure the key that protects stored keys from recombined bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Unsupported`] for seals that do not take their
    /// key from operators.
    async fn set_unseal_key(&self, _key: &[u8]) -> Result<(), SealError> {
        Err(self.unsupported("setting the unseal key"))
    }

    /// Drop any in-memory key material. Called when the node seals.
    async fn forget_keys(&self) {}

    /// Build an [`SealError::Unsupported`] for this seal.
    fn unsupported(&self, operation: &'static str) -> SealError {
        SealError::Unsupported {
            seal_type: self.barrier_type().to_owned(),
            operation,
        }
    }
}

/// A plaintext config record with an in-memory copy.
pub(crate) struct ConfigRecord {
    storage: Arc<dyn StorageBackend>,
    path: &'static str,
    cached: RwLock<Option<SealConfig>>,
}

impl ConfigRecord {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>, path: &'static str) -> Self {
        Self {
            storage,
            path,
            cached: RwLock::new(None),
        }
    }

    pub(crate) async fn load(&self) -> Result<Option<SealConfig>, SealError> {
        if let Some(config) = self.cached.read().await.as_ref() {
            return Ok(Some(config.clone()));
        }
        let Some(bytes) = self.storage.get(self.path).await? else {
            return Ok(None);
        };
        let config = SealConfig::decode(self.path, &bytes)?;
        *self.cached.write().await = Some(config.clone());
        Ok(Some(config))
    }

    pub(crate) async fn store(&self, config: Option<&SealConfig>) -> Result<(), SealError> {
        match config {
            None => {
                self.storage.delete(self.path).await?;
                *self.cached.write().await = None;
            }
            Some(config) => {
                let mut config = config.clone();
                config.validate()?;
                self.storage
                    .put(self.path, &config.encode(self.path)?)
                    .await?;
                *self.cached.write().await = Some(config);
            }
        }
        Ok(())
    }

    pub(crate) async fn set_cached(&self, config: Option<SealConfig>) {
        *self.cached.write().await = config;
    }
}

/// Encode keys as a JSON array of base64 strings.
pub(crate) fn encode_keys(keys: &[EncryptionKey]) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let encoded: Vec<Zeroizing<String>> = keys
        .iter()
        .map(|k| Zeroizing::new(BASE64.encode(k.as_bytes())))
        .collect();
    let as_str: Vec<&str> = encoded.iter().map(|s| s.as_str()).collect();
    serde_json::to_vec(&as_str)
        .map(Zeroizing::new)
        .map_err(|e| SealError::Serialization {
            key: STORED_KEYS_PATH.to_owned(),
            reason: e.to_string(),
        })
}

/// Decode the output of [`encode_keys`].
pub(crate) fn decode_keys(bytes: &[u8]) -> Result<Vec<EncryptionKey>, SealError> {
    let malformed = |reason: String| SealError::Serialization {
        key: STORED_KEYS_PATH.to_owned(),
        reason,
    };
    let mut encoded: Vec<String> =
        serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    let keys = encoded
        .iter()
        .map(|s| {
            let raw = Zeroizing::new(
                BASE64
                    .decode(s.as_bytes())
                    .map_err(|e| malformed(e.to_string()))?,
            );
            Ok(EncryptionKey::from_slice(&raw)?)
        })
        .collect();
    encoded.zeroize();
    keys
}
