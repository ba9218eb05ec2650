//! Daemon configuration.
//!
//! Everything comes from `STRONGROOM_*` environment variables with
//! development-friendly defaults. Malformed values that would silently
//! weaken the node (a bad seal key, HA without a redirect address)
//! are errors rather than defaults.

use std::fmt;
use std::time::Duration;

/// Errors from reading the daemon configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable has a value that cannot be used.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    /// A variable is required by another setting but missing.
    #[error("{var} is required when {because}")]
    Missing {
        var: &'static str,
        because: &'static str,
    },
}

/// Where the node keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` at the given directory.
    RocksDb { path: String },
}

/// Which seal protects the root key.
#[derive(Clone, PartialEq, Eq)]
pub enum SealKind {
    /// Operators unseal with key shares.
    Shamir,
    /// The root key is wrapped with a locally configured key.
    Static { key: Vec<u8> },
}

impl fmt::Debug for SealKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shamir => f.write_str("Shamir"),
            Self::Static { .. } => f.write_str("Static { key: [REDACTED] }"),
        }
    }
}

/// Daemon configuration.
#[derive(Clone)]
pub struct NodeConfig {
    /// Storage backend.
    pub storage: StorageKind,
    /// Active seal.
    pub seal: SealKind,
    /// Key of a disabled static seal to migrate away from.
    pub disabled_seal_key: Option<Vec<u8>>,
    /// Contend for the in-process leadership lock.
    pub ha: bool,
    /// Address advertised to other nodes while active.
    pub redirect_addr: Option<String>,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Skip `mlockall` (for development without `CAP_IPC_LOCK`).
    pub disable_mlock: bool,
    /// Keep the physical read cache off.
    pub disable_cache: bool,
    /// Most entries the physical read cache holds.
    pub cache_size: usize,
    /// How long shutdown waits for the node to seal.
    pub shutdown_timeout: Duration,
}

impl NodeConfig {
    /// Load configuration from the process environment.
    ///
    /// - `STRONGROOM_STORAGE`: `memory` or `rocksdb` (default: `memory`)
    /// - `STRONGROOM_STORAGE_PATH`: `RocksDB` directory (default: `./data`)
    /// - `STRONGROOM_SEAL`: `shamir` or `static` (default: `shamir`)
    /// - `STRONGROOM_SEAL_KEY`: hex key material for the static seal
    /// - `STRONGROOM_DISABLED_SEAL_KEY`: hex key of a static seal being migrated away from
    /// - `STRONGROOM_HA`: enable leadership contention (default: `false`)
    /// - `STRONGROOM_REDIRECT_ADDR`: advertised address, required with HA
    /// - `STRONGROOM_LOG_LEVEL`: log filter (default: `info`)
    /// - `STRONGROOM_DISABLE_MLOCK`: skip `mlockall` (default: `false`)
    /// - `STRONGROOM_DISABLE_CACHE`: keep the read cache off (default: `false`)
    /// - `STRONGROOM_CACHE_SIZE`: read cache entries (default: `131072`)
    /// - `STRONGROOM_SHUTDOWN_TIMEOUT`: seconds to wait for sealing (default: `30`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unusable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup` instead of the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unusable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let flag = |var: &str| lookup(var).is_some_and(|v| v == "true" || v == "1");

        let storage = match lookup("STRONGROOM_STORAGE")
            .unwrap_or_else(|| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageKind::Memory,
            "rocksdb" => StorageKind::RocksDb {
                path: lookup("STRONGROOM_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "STRONGROOM_STORAGE",
                    reason: format!("unknown storage '{other}'"),
                });
            }
        };

        let seal = match lookup("STRONGROOM_SEAL")
            .unwrap_or_else(|| "shamir".to_owned())
            .to_lowercase()
            .as_str()
        {
            "shamir" => SealKind::Shamir,
            "static" => {
                let hex_key = lookup("STRONGROOM_SEAL_KEY").ok_or(ConfigError::Missing {
                    var: "STRONGROOM_SEAL_KEY",
                    because: "STRONGROOM_SEAL is static",
                })?;
                SealKind::Static {
                    key: decode_key("STRONGROOM_SEAL_KEY", &hex_key)?,
                }
            }
            other => {
                return Err(ConfigError::Invalid {
                    var: "STRONGROOM_SEAL",
                    reason: format!("unknown seal '{other}'"),
                });
            }
        };

        let disabled_seal_key = lookup("STRONGROOM_DISABLED_SEAL_KEY")
            .map(|v| decode_key("STRONGROOM_DISABLED_SEAL_KEY", &v))
            .transpose()?;

        let ha = flag("STRONGROOM_HA");
        let redirect_addr = lookup("STRONGROOM_REDIRECT_ADDR");
        if ha && redirect_addr.is_none() {
            return Err(ConfigError::Missing {
                var: "STRONGROOM_REDIRECT_ADDR",
                because: "STRONGROOM_HA is enabled",
            });
        }

        let cache_size = match lookup("STRONGROOM_CACHE_SIZE") {
            None => strongroom_storage::DEFAULT_CACHE_SIZE,
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "STRONGROOM_CACHE_SIZE",
                        reason: format!("'{v}' is not a positive number of entries"),
                    });
                }
            },
        };

        let shutdown_timeout = match lookup("STRONGROOM_SHUTDOWN_TIMEOUT") {
            None => Duration::from_secs(30),
            Some(v) => v.parse().map(Duration::from_secs).map_err(|_| ConfigError::Invalid {
                var: "STRONGROOM_SHUTDOWN_TIMEOUT",
                reason: format!("'{v}' is not a number of seconds"),
            })?,
        };

        Ok(Self {
            storage,
            seal,
            disabled_seal_key,
            ha,
            redirect_addr,
            log_level: lookup("STRONGROOM_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            disable_mlock: flag("STRONGROOM_DISABLE_MLOCK"),
            disable_cache: flag("STRONGROOM_DISABLE_CACHE"),
            cache_size,
            shutdown_timeout,
        })
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("storage", &self.storage)
            .field("seal", &self.seal)
            .field("disabled_seal", &self.disabled_seal_key.is_some())
            .field("ha", &self.ha)
            .field("redirect_addr", &self.redirect_addr)
            .field("log_level", &self.log_level)
            .field("disable_mlock", &self.disable_mlock)
            .field("disable_cache", &self.disable_cache)
            .field("cache_size", &self.cache_size)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

fn decode_key(var: &'static str, value: &str) -> Result<Vec<u8>, ConfigError> {
    let key = hex::decode(value.trim()).map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })?;
    if key.len() < 16 {
        return Err(ConfigError::Invalid {
            var,
            reason: "key material must be at least 16 bytes".to_owned(),
        });
    }
    Ok(key)
}
