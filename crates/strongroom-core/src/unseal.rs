//! Accumulating key shares and turning them into the root key.
//!
//! Shares arrive one per call. An [`UnsealSession`] keeps the distinct ones
//! until the threshold is reached, then they are combined and the session is
//! discarded whether or not the combined key turns out to be right.

use std::fmt;
use std::sync::Arc;

use strongroom_storage::StorageBackend;
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey};
use crate::error::{CoreError, SealError};
use crate::seal::{Seal, ShamirSeal, StoredKeysSupport};
use crate::shamir::{self, SHARE_OVERHEAD};

/// Shares submitted so far in one unseal attempt.
pub struct UnsealSession {
    parts: Vec<Zeroizing<Vec<u8>>>,
    nonce: String,
}

impl UnsealSession {
    /// Start an empty session with a fresh nonce.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Opaque identifier of this attempt.
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Number of distinct shares recorded.
    #[must_use]
    pub fn progress(&self) -> usize {
        self.parts.len()
    }

    /// Record a share. Returns `false` if an identical share was already
    /// recorded.
    pub fn record_part(&mut self, part: &[u8]) -> bool {
        // Compare against every recorded share so timing does not reveal
        // which one matched.
        let mut seen = false;
        for existing in &self.parts {
            seen |= crypto::constant_time_eq(existing, part);
        }
        if seen {
            return false;
        }
        self.parts.push(Zeroizing::new(part.to_vec()));
        true
    }

    /// Combine the recorded shares once `threshold` of them are present.
    ///
    /// Returns `Ok(None)` while more shares are needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidKey`] if the shares do not combine.
    pub fn attempt_combine(
        &self,
        threshold: usize,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, CoreError> {
        if self.parts.len() < threshold {
            return Ok(None);
        }
        if threshold == 1 {
            return Ok(self.parts.first().map(|p| Zeroizing::new(p.to_vec())));
        }
        let parts: Vec<&[u8]> = self.parts.iter().map(|p| p.as_slice()).collect();
        shamir::combine(&parts, threshold).map(Some).map_err(|e| {
            tracing::debug!(error = %e, "failed to combine key shares");
            CoreError::invalid_key("failed to compute combined key")
        })
    }
}

impl Default for UnsealSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UnsealSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealSession")
            .field("nonce", &self.nonce)
            .field("progress", &self.parts.len())
            .finish()
    }
}

/// Reject a share whose length cannot belong to a key of `min..=max` bytes.
///
/// # Errors
///
/// Returns [`CoreError::InvalidKey`] when the length is out of range.
pub fn validate_key_length(key: &[u8], min: usize, max: usize) -> Result<(), CoreError> {
    if key.len() < min {
        return Err(CoreError::invalid_key(format!(
            "key is shorter than minimum {min} bytes"
        )));
    }
    let max = max.saturating_add(SHARE_OVERHEAD);
    if key.len() > max {
        return Err(CoreError::invalid_key(format!(
            "key is longer than maximum {max} bytes"
        )));
    }
    Ok(())
}

/// Options for [`root_key_from_unseal_key`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeriveOptions {
    /// Use a throwaway Shamir seal so the live seal's key is left untouched.
    pub use_test_seal: bool,
    /// Return `Ok(None)` instead of failing when no stored key exists.
    pub allow_missing: bool,
}

/// Derive the root key from a combined unseal (or recovery) key.
///
/// `storage` is only used to build the throwaway seal of
/// [`DeriveOptions::use_test_seal`].
///
/// # Errors
///
/// - [`CoreError::InvalidKey`] if a recovery key does not verify.
/// - [`CoreError::Decrypt`] if stored keys cannot be unwrapped.
/// - [`CoreError::Internal`] if the number of stored keys is not one.
pub async fn root_key_from_unseal_key(
    seal: &dyn Seal,
    storage: &Arc<dyn StorageBackend>,
    combined: &[u8],
    options: DeriveOptions,
) -> Result<Option<EncryptionKey>, CoreError> {
    let stored = match seal.stored_keys_supported().await {
        StoredKeysSupport::Generic => {
            seal.verify_recovery_key(combined)
                .await
                .map_err(recovery_error)?;
            seal.get_stored_keys().await?
        }
        StoredKeysSupport::ShamirRoot => {
            if options.use_test_seal {
                let candidate = ShamirSeal::new(Arc::clone(storage));
                candidate
                    .set_cached_barrier_config(seal.barrier_config().await?)
                    .await;
                candidate.set_unseal_key(combined).await.map_err(unseal_key_error)?;
                candidate.get_stored_keys().await?
            } else {
                seal.set_unseal_key(combined)
                    .await
                    .map_err(unseal_key_error)?;
                seal.get_stored_keys().await?
            }
        }
        StoredKeysSupport::NotSupported => {
            let root = EncryptionKey::from_slice(combined)
                .map_err(|_| CoreError::invalid_key("combined key has the wrong length"))?;
            return Ok(Some(root));
        }
    };

    if stored.is_empty() && options.allow_missing {
        return Ok(None);
    }
    if stored.len() != 1 {
        tracing::error!(count = stored.len(), "expected exactly one stored root key");
        return Err(CoreError::Internal);
    }
    Ok(stored.into_iter().next())
}

fn recovery_error(err: SealError) -> CoreError {
    match err {
        SealError::RecoveryKeyMismatch | SealError::RecoveryKeyNotFound => {
            CoreError::invalid_key("recovery key verification failed")
        }
        other => other.into(),
    }
}

fn unseal_key_error(err: SealError) -> CoreError {
    tracing::debug!(error = %err, "failed to set up unseal key");
    CoreError::invalid_key("failed to set up unseal key")
}
