//! Persisted description of a secret-sharing scheme.

use serde::{Deserialize, Serialize};

use crate::error::SealError;
use crate::shamir::MAX_SHARES;

/// Seal type of the local threshold seal.
pub const SHAMIR_SEAL_TYPE: &str = "shamir";

/// Physical path of the barrier seal configuration.
pub const BARRIER_CONFIG_PATH: &str = "core/seal-config";

/// Physical path of the recovery seal configuration.
pub const RECOVERY_CONFIG_PATH: &str = "core/recovery-config";

/// How a key is split and how many of its shares the node stores itself.
///
/// Stored as JSON. Records written before the type field existed
/// deserialize with an empty type; [`validate`](Self::validate) fills it in
/// as [`SHAMIR_SEAL_TYPE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    /// Seal type that wrote this record.
    #[serde(rename = "type", default)]
    pub seal_type: String,
    /// Total number of shares handed out.
    pub secret_shares: usize,
    /// Shares needed to recombine the key.
    pub secret_threshold: usize,
    /// Shares kept by the node itself. `0` marks a legacy Shamir seal whose
    /// combined key is the root key.
    #[serde(default)]
    pub stored_shares: usize,
}

impl SealConfig {
    /// Build a config of the given type.
    #[must_use]
    pub fn new(
        seal_type: impl Into<String>,
        secret_shares: usize,
        secret_threshold: usize,
        stored_shares: usize,
    ) -> Self {
        Self {
            seal_type: seal_type.into(),
            secret_shares,
            secret_threshold,
            stored_shares,
        }
    }

    /// Check the share/threshold relationship and normalize a legacy empty
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] describing the first violated rule.
    pub fn validate(&mut self) -> Result<(), SealError> {
        if self.seal_type.is_empty() {
            self.seal_type = SHAMIR_SEAL_TYPE.to_owned();
        }
        if self.secret_shares < 1 {
            return Err(invalid("shares must be at least one"));
        }
        if self.secret_threshold < 1 {
            return Err(invalid("threshold must be at least one"));
        }
        if self.secret_shares > 1 && self.secret_threshold == 1 {
            return Err(invalid(
                "threshold must be greater than one for multiple shares",
            ));
        }
        if self.secret_shares > MAX_SHARES {
            return Err(invalid(format!("shares must be at most {MAX_SHARES}")));
        }
        if self.secret_threshold > self.secret_shares {
            return Err(invalid("threshold cannot be larger than shares"));
        }
        if self.stored_shares > 1 {
            return Err(invalid("stored shares must be zero or one"));
        }
        Ok(())
    }

    /// Parse and validate a persisted record.
    ///
    /// # Errors
    ///
    /// - [`SealError::Serialization`] if the JSON is malformed.
    /// - [`SealError::InvalidConfig`] if the decoded config is invalid.
    pub fn decode(path: &str, bytes: &[u8]) -> Result<Self, SealError> {
        let mut config: Self =
            serde_json::from_slice(bytes).map_err(|e| SealError::Serialization {
                key: path.to_owned(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Encode for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Serialization`] if encoding fails.
    pub fn encode(&self, path: &str) -> Result<Vec<u8>, SealError> {
        serde_json::to_vec(self).map_err(|e| SealError::Serialization {
            key: path.to_owned(),
            reason: e.to_string(),
        })
    }
}

fn invalid(reason: impl Into<String>) -> SealError {
    SealError::InvalidConfig {
        reason: reason.into(),
    }
}
