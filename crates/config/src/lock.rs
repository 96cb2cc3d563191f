//! Lock backend configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ConfigError;

/// Default lease lifetime (one minute)
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;

/// Default pause between "not obtained" replies from the mutex service
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Which coordination backend guards certificate writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockBackendKind {
    /// Lease stored in a shared Redis-compatible key-value store
    Lease,
    /// Remote mutex service polled over HTTP
    MutexService,
    /// Process-local lease table (single host, tests)
    #[default]
    Memory,
}

/// Lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct LockConfig {
    /// Active backend
    #[serde(default)]
    pub backend: LockBackendKind,

    /// Lease lifetime in seconds. Must exceed the duration of the guarded
    /// operation.
    #[serde(default = "default_ttl_secs")]
    #[validate(range(min = 1))]
    pub ttl_secs: u64,

    /// Maximum time to wait for a contended lock, 0 waits forever
    #[serde(default)]
    pub acquire_timeout_secs: u64,

    /// Settings for the mutex service backend
    #[serde(default)]
    pub mutex_service: Option<MutexServiceConfig>,

    /// Settings for the lease backend
    #[serde(default)]
    pub lease: Option<LeaseStoreConfig>,
}

fn default_ttl_secs() -> u64 { DEFAULT_LOCK_TTL_SECS }

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::default(),
            ttl_secs: default_ttl_secs(),
            acquire_timeout_secs: 0,
            mutex_service: None,
            lease: None,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_secs > 0).then(|| Duration::from_secs(self.acquire_timeout_secs))
    }

    pub(crate) fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        match self.backend {
            LockBackendKind::MutexService => {
                let service = self.mutex_service.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(
                        "lock backend 'mutex-service' requires a [lock.mutex-service] table"
                            .to_string(),
                    )
                })?;
                service.validate()?;
                service.check_scheme()?;
            }
            LockBackendKind::Lease => {
                let lease = self.lease.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(
                        "lock backend 'lease' requires a [lock.lease] table".to_string(),
                    )
                })?;
                lease.validate()?;
            }
            LockBackendKind::Memory => {}
        }

        Ok(())
    }
}

/// Remote mutex service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct MutexServiceConfig {
    /// Base URL of the service, e.g. `https://mutex.example.com`
    #[validate(url)]
    pub endpoint: String,

    /// API key sent with every request
    #[validate(length(min = 1))]
    pub api_key: String,

    /// Pause between polls while the mutex is held elsewhere
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,

    /// Timeout of a single HTTP request
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 { DEFAULT_POLL_INTERVAL_MS }
fn default_request_timeout_secs() -> u64 { 10 }

impl MutexServiceConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn check_scheme(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| ConfigError::Invalid(format!("mutex service endpoint: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "mutex service endpoint must use http or https, got '{other}'"
            ))),
        }
    }
}

/// Shared key-value store settings for the lease backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct LeaseStoreConfig {
    /// `host:port` of the store
    #[validate(length(min = 1))]
    pub address: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    #[validate(range(min = 0))]
    pub database: i64,
}

impl LeaseStoreConfig {
    /// Connection URL in `redis://[user][:password@]host:port/db` form
    pub fn connection_url(&self) -> String {
        let credentials = match (&self.username, &self.password) {
            (None, None) => String::new(),
            (user, password) => format!(
                "{}{}@",
                user.as_deref().map(urlencoding::encode).unwrap_or_default(),
                password
                    .as_deref()
                    .map(|p| format!(":{}", urlencoding::encode(p)))
                    .unwrap_or_default(),
            ),
        };
        format!("redis://{}{}/{}", credentials, self.address, self.database)
    }
}
