//! The auto seal: the root key is wrapped by an external key service.
//!
//! Operators never hold the root key's protection; they hold shares of a
//! recovery key instead, which authorizes privileged operations and is
//! verified before any combined key is trusted.
//!
//! # Security model
//!
//! - Wrapped blobs record the id of the key that produced them. A blob
//!   wrapped by another key fails with [`SealError::Decrypt`] before any
//!   decryption is attempted.
//! - The recovery key is compared in constant time.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strongroom_storage::StorageBackend;
use zeroize::Zeroizing;

use super::config::{BARRIER_CONFIG_PATH, RECOVERY_CONFIG_PATH};
use super::{
    ConfigRecord, RECOVERY_KEY_PATH, STORED_KEYS_PATH, Seal, SealConfig, StoredKeysSupport,
    decode_keys, encode_keys,
};
use crate::crypto::{self, EncryptionKey};
use crate::error::SealError;

/// An external key-encryption service (KMS, HSM, transit engine).
#[async_trait::async_trait]
pub trait KeyWrapper: Send + Sync + fmt::Debug {
    /// Seal type reported for this wrapper, e.g. `"static"`.
    fn wrapper_type(&self) -> &str;

    /// Identifier of the key currently used for wrapping.
    fn key_id(&self) -> String;

    /// Wrap `plaintext`, binding `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Wrapper`] if the service fails.
    async fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SealError>;

    /// Unwrap output of [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Decrypt`] if the blob does not authenticate.
    async fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SealError>;
}

/// A wrapper with a locally configured key, derived with HKDF from operator
/// material. Stands in for a real key service in single-host deployments.
pub struct StaticKeyWrapper {
    key: EncryptionKey,
    key_id: String,
}

impl StaticKeyWrapper {
    /// Derive the wrapping key from `material`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] for empty material and
    /// [`SealError::Crypto`] if derivation fails.
    pub fn new(material: &[u8]) -> Result<Self, SealError> {
        if material.is_empty() {
            return Err(SealError::InvalidConfig {
                reason: "static seal key must not be empty".to_owned(),
            });
        }
        let key = crypto::derive_key(material, None, b"strongroom-seal-wrap-v1")?;
        let digest = Sha256::digest(key.as_bytes());
        let key_id = hex::encode(digest.get(..8).unwrap_or_default());
        Ok(Self { key, key_id })
    }
}

#[async_trait::async_trait]
impl KeyWrapper for StaticKeyWrapper {
    fn wrapper_type(&self) -> &str {
        "static"
    }

    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    async fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SealError> {
        crypto::encrypt_with_aad(&self.key, plaintext, aad).map_err(|e| SealError::Wrapper {
            wrapper: self.key_id.clone(),
            reason: e.to_string(),
        })
    }

    async fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SealError> {
        crypto::decrypt_with_aad(&self.key, ciphertext, aad).map_err(|e| SealError::Decrypt {
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for StaticKeyWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyWrapper")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct WrappedBlob {
    key_id: String,
    ciphertext: String,
}

/// Seal delegating root-key protection to a [`KeyWrapper`].
pub struct AutoSeal {
    storage: Arc<dyn StorageBackend>,
    wrapper: Arc<dyn KeyWrapper>,
    barrier_config: ConfigRecord,
    recovery_config: ConfigRecord,
}

impl AutoSeal {
    /// Create an auto seal over the physical storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, wrapper: Arc<dyn KeyWrapper>) -> Self {
        Self {
            barrier_config: ConfigRecord::new(Arc::clone(&storage), BARRIER_CONFIG_PATH),
            recovery_config: ConfigRecord::new(Arc::clone(&storage), RECOVERY_CONFIG_PATH),
            storage,
            wrapper,
        }
    }

    async fn write_wrapped(&self, path: &str, plaintext: &[u8]) -> Result<(), SealError> {
        let ciphertext = self.wrapper.encrypt(plaintext, path.as_bytes()).await?;
        let blob = WrappedBlob {
            key_id: self.wrapper.key_id(),
            ciphertext: BASE64.encode(ciphertext),
        };
        let bytes = serde_json::to_vec(&blob).map_err(|e| SealError::Serialization {
            key: path.to_owned(),
            reason: e.to_string(),
        })?;
        self.storage.put(path, &bytes).await?;
        Ok(())
    }

    async fn read_wrapped(&self, path: &str) -> Result<Option<Zeroizing<Vec<u8>>>, SealError> {
        let Some(bytes) = self.storage.get(path).await? else {
            return Ok(None);
        };
        let blob: WrappedBlob =
            serde_json::from_slice(&bytes).map_err(|_| SealError::Decrypt {
                reason: format!("'{path}' is not a wrapped blob"),
            })?;
        let current = self.wrapper.key_id();
        if blob.key_id != current {
            return Err(SealError::Decrypt {
                reason: format!(
                    "'{path}' was wrapped by key '{}', current key is '{current}'",
                    blob.key_id
                ),
            });
        }
        let ciphertext = BASE64
            .decode(blob.ciphertext.as_bytes())
            .map_err(|e| SealError::Decrypt {
                reason: e.to_string(),
            })?;
        let plain = self.wrapper.decrypt(&ciphertext, path.as_bytes()).await?;
        Ok(Some(Zeroizing::new(plain)))
    }
}

#[async_trait::async_trait]
impl Seal for AutoSeal {
    fn barrier_type(&self) -> &str {
        self.wrapper.wrapper_type()
    }

    fn recovery_key_supported(&self) -> bool {
        true
    }

    async fn stored_keys_supported(&self) -> StoredKeysSupport {
        StoredKeysSupport::Generic
    }

    async fn barrier_config(&self) -> Result<Option<SealConfig>, SealError> {
        self.barrier_config.load().await
    }

    async fn set_barrier_config(&self, config: Option<&SealConfig>) -> Result<(), SealError> {
        self.barrier_config.store(config).await
    }

    async fn set_cached_barrier_config(&self, config: Option<SealConfig>) {
        self.barrier_config.set_cached(config).await;
    }

    async fn recovery_config(&self) -> Result<Option<SealConfig>, SealError> {
        self.recovery_config.load().await
    }

    async fn set_recovery_config(&self, config: Option<&SealConfig>) -> Result<(), SealError> {
        self.recovery_config.store(config).await
    }

    async fn set_cached_recovery_config(&self, config: Option<SealConfig>) {
        self.recovery_config.set_cached(config).await;
    }

    async fn get_stored_keys(&self) -> Result<Vec<EncryptionKey>, SealError> {
        match self.read_wrapped(STORED_KEYS_PATH).await? {
            Some(plain) => decode_keys(&plain),
            None => Ok(Vec::new()),
        }
    }

    async fn set_stored_keys(&self, keys: &[EncryptionKey]) -> Result<(), SealError> {
        let plain = encode_keys(keys)?;
        self.write_wrapped(STORED_KEYS_PATH, &plain).await
    }

    async fn recovery_key(&self) -> Result<Zeroizing<Vec<u8>>, SealError> {
        self.read_wrapped(RECOVERY_KEY_PATH)
            .await?
            .ok_or(SealError::RecoveryKeyNotFound)
    }

    async fn set_recovery_key(&self, key: &[u8]) -> Result<(), SealError> {
        if key.is_empty() {
            return Err(SealError::InvalidConfig {
                reason: "recovery key must not be empty".to_owned(),
            });
        }
        self.write_wrapped(RECOVERY_KEY_PATH, key).await
    }

    async fn verify_recovery_key(&self, key: &[u8]) -> Result<(), SealError> {
        let stored = self.recovery_key().await?;
        if crypto::constant_time_eq(&stored, key) {
            Ok(())
        } else {
            Err(SealError::RecoveryKeyMismatch)
        }
    }
}

impl fmt::Debug for AutoSeal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoSeal")
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}
