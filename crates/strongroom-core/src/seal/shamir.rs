//! The local threshold seal.
//!
//! The key recombined from operator shares is either the root key itself
//! (legacy records with `stored_shares == 0`) or a key-encryption key for the
//! root key stored at [`STORED_KEYS_PATH`].

use std::fmt;
use std::sync::Arc;

use strongroom_storage::StorageBackend;
use tokio::sync::RwLock;

use super::config::{BARRIER_CONFIG_PATH, SHAMIR_SEAL_TYPE};
use super::{ConfigRecord, STORED_KEYS_PATH, Seal, SealConfig, StoredKeysSupport, decode_keys, encode_keys};
use crate::crypto::{self, EncryptionKey};
use crate::error::SealError;

/// Threshold seal whose key comes from operator shares.
pub struct ShamirSeal {
    storage: Arc<dyn StorageBackend>,
    barrier_config: ConfigRecord,
    unseal_key: RwLock<Option<EncryptionKey>>,
}

impl ShamirSeal {
    /// Create a Shamir seal over the physical storage.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            barrier_config: ConfigRecord::new(Arc::clone(&storage), BARRIER_CONFIG_PATH),
            storage,
            unseal_key: RwLock::new(None),
        }
    }

    /// Whether the persisted config is a legacy one that stores nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] if no config is stored.
    pub async fn is_legacy(&self) -> Result<bool, SealError> {
        let config = self
            .barrier_config
            .load()
            .await?
            .ok_or_else(|| SealError::InvalidConfig {
                reason: "no seal config found".to_owned(),
            })?;
        Ok(config.stored_shares == 0)
    }
}

#[async_trait::async_trait]
impl Seal for ShamirSeal {
    fn barrier_type(&self) -> &str {
        SHAMIR_SEAL_TYPE
    }

    fn recovery_key_supported(&self) -> bool {
        false
    }

    async fn stored_keys_supported(&self) -> StoredKeysSupport {
        match self.is_legacy().await {
            Ok(true) => StoredKeysSupport::NotSupported,
            _ => StoredKeysSupport::ShamirRoot,
        }
    }

    async fn barrier_config(&self) -> Result<Option<SealConfig>, SealError> {
        self.barrier_config.load().await
    }

    async fn set_barrier_config(&self, config: Option<&SealConfig>) -> Result<(), SealError> {
        if let Some(config) = config {
            if !config.seal_type.is_empty() && config.seal_type != SHAMIR_SEAL_TYPE {
                return Err(SealError::InvalidConfig {
                    reason: format!(
                        "shamir seal cannot store a '{}' barrier config",
                        config.seal_type
                    ),
                });
            }
        }
        self.barrier_config.store(config).await
    }

    async fn set_cached_barrier_config(&self, config: Option<SealConfig>) {
        self.barrier_config.set_cached(config).await;
    }

    async fn get_stored_keys(&self) -> Result<Vec<EncryptionKey>, SealError> {
        if self.is_legacy().await? {
            return Err(self.unsupported("stored keys"));
        }
        let guard = self.unseal_key.read().await;
        let kek = guard.as_ref().ok_or(SealError::KeyNotSet)?;
        let Some(blob) = self.storage.get(STORED_KEYS_PATH).await? else {
            return Ok(Vec::new());
        };
        let plain = zeroize::Zeroizing::new(
            crypto::decrypt_with_aad(kek, &blob, STORED_KEYS_PATH.as_bytes()).map_err(|e| {
                SealError::Decrypt {
                    reason: e.to_string(),
                }
            })?,
        );
        decode_keys(&plain)
    }

    async fn set_stored_keys(&self, keys: &[EncryptionKey]) -> Result<(), SealError> {
        let guard = self.unseal_key.read().await;
        let kek = guard.as_ref().ok_or(SealError::KeyNotSet)?;
        let plain = encode_keys(keys)?;
        let blob = crypto::encrypt_with_aad(kek, &plain, STORED_KEYS_PATH.as_bytes())?;
        self.storage.put(STORED_KEYS_PATH, &blob).await?;
        Ok(())
    }

    async fn set_unseal_key(&self, key: &[u8]) -> Result<(), SealError> {
        let kek = EncryptionKey::from_slice(key)?;
        *self.unseal_key.write().await = Some(kek);
        Ok(())
    }

    async fn forget_keys(&self) {
        *self.unseal_key.write().await = None;
    }
}

impl fmt::Debug for ShamirSeal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShamirSeal").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use strongroom_storage::MemoryBackend;

    use super::*;

    async fn seal_with(stored_shares: usize) -> ShamirSeal {
        let seal = ShamirSeal::new(Arc::new(MemoryBackend::new()));
        seal.set_barrier_config(Some(&SealConfig::new(SHAMIR_SEAL_TYPE, 3, 2, stored_shares)))
            .await
            .unwrap();
        seal
    }

    #[tokio::test]
    async fn stored_keys_need_the_unseal_key() {
        let seal = seal_with(1).await;
        let root = EncryptionKey::generate();
        assert!(matches!(
            seal.set_stored_keys(&[root.clone()]).await,
            Err(SealError::KeyNotSet)
        ));

        let kek = EncryptionKey::generate();
        seal.set_unseal_key(kek.as_bytes()).await.unwrap();
        seal.set_stored_keys(&[root.clone()]).await.unwrap();
        assert_eq!(seal.get_stored_keys().await.unwrap(), vec![root]);
    }

    #[tokio::test]
    async fn wrong_unseal_key_is_decrypt_error() {
        let seal = seal_with(1).await;
        seal.set_unseal_key(EncryptionKey::generate().as_bytes())
            .await
            .unwrap();
        seal.set_stored_keys(&[EncryptionKey::generate()]).await.unwrap();

        seal.set_unseal_key(EncryptionKey::generate().as_bytes())
            .await
            .unwrap();
        assert!(matches!(
            seal.get_stored_keys().await,
            Err(SealError::Decrypt { .. })
        ));
    }

    #[tokio::test]
    async fn legacy_config_reports_no_stored_keys() {
        let seal = seal_with(0).await;
        assert_eq!(
            seal.stored_keys_supported().await,
            StoredKeysSupport::NotSupported
        );
        assert!(matches!(
            seal.get_stored_keys().await,
            Err(SealError::Unsupported { .. })
        ));
        assert_eq!(
            seal_with(1).await.stored_keys_supported().await,
            StoredKeysSupport::ShamirRoot
        );
    }

    #[tokio::test]
    async fn rejects_foreign_barrier_config() {
        let seal = ShamirSeal::new(Arc::new(MemoryBackend::new()));
        assert!(
            seal.set_barrier_config(Some(&SealConfig::new("static", 1, 1, 1)))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn recovery_operations_are_unsupported() {
        let seal = seal_with(1).await;
        assert!(!seal.recovery_key_supported());
        assert!(matches!(
            seal.recovery_key().await,
            Err(SealError::Unsupported { .. })
        ));
        assert!(seal.verify_recovery_key(b"anything").await.is_err());
    }

    #[tokio::test]
    async fn forget_keys_clears_unseal_key() {
        let seal = seal_with(1).await;
        seal.set_unseal_key(EncryptionKey::generate().as_bytes())
            .await
            .unwrap();
        seal.forget_keys().await;
        assert!(matches!(
            seal.get_stored_keys().await,
            Err(SealError::KeyNotSet)
        ));
    }
}
