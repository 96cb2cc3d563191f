//! Configuration for certlock.
//!
//! Configuration is a TOML document with two tables: `[storage]` selects
//! the object store holding certificate material, `[lock]` selects the
//! coordination backend used to serialize writers across processes.
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "certificates"
//! prefix = "ssl"
//!
//! [storage.s3]
//! endpoint = "s3.example.com"
//! access-key = "AKIA..."
//! secret-key = "..."
//!
//! [lock]
//! backend = "mutex-service"
//! ttl-secs = 60
//!
//! [lock.mutex-service]
//! endpoint = "https://mutex.example.com"
//! api-key = "secret"
//! ```

mod error;
mod lock;
mod storage;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use error::ConfigError;
pub use lock::{
    LeaseStoreConfig, LockBackendKind, LockConfig, MutexServiceConfig, DEFAULT_LOCK_TTL_SECS,
    DEFAULT_POLL_INTERVAL_MS,
};
pub use storage::{S3StorageConfig, StorageBackendKind, StorageConfig, DEFAULT_S3_REGION};

/// Environment variable holding the configuration file path
pub const CONFIG_PATH_ENV: &str = "CERTLOCK_CONFIG";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Object storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Lock backend settings
    #[serde(default)]
    pub lock: LockConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        trace!(path = %path.display(), "Reading configuration file");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content)?;
        debug!(
            path = %path.display(),
            storage_backend = ?config.storage.backend,
            lock_backend = ?config.lock.backend,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration, including the settings of the
    /// selected lock backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate_all()?;
        self.lock.validate_all()?;
        Ok(())
    }
}
