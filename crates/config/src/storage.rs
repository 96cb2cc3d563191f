//! Object storage configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ConfigError;

/// Default signing region for S3-compatible services that ignore it
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Where certificate material is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackendKind {
    /// S3-compatible object storage service
    S3,
    /// Directory tree on a local or shared filesystem
    Filesystem,
    /// In-process map, lost on exit
    #[default]
    Memory,
}

/// Object storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Root directory for the filesystem backend
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Bucket holding the objects
    #[serde(default = "default_bucket")]
    #[validate(length(min = 1))]
    pub bucket: String,

    /// Key prefix isolating this store inside the bucket
    #[serde(default)]
    pub prefix: String,

    /// Settings for the S3 backend
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

fn default_bucket() -> String { "certificates".to_string() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            root: None,
            bucket: default_bucket(),
            prefix: String::new(),
            s3: None,
        }
    }
}

impl StorageConfig {
    pub(crate) fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        match self.backend {
            StorageBackendKind::Filesystem if self.root.is_none() => {
                return Err(ConfigError::Invalid(
                    "storage backend 'filesystem' requires 'root'".to_string(),
                ));
            }
            StorageBackendKind::S3 => {
                let s3 = self.s3.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(
                        "storage backend 's3' requires a [storage.s3] table".to_string(),
                    )
                })?;
                s3.validate()?;
            }
            _ => {}
        }

        // A configured service that is not selected is almost certainly a
        // missing `backend` line; refuse rather than store in memory.
        if self.s3.is_some() && self.backend != StorageBackendKind::S3 {
            return Err(ConfigError::Invalid(format!(
                "[storage.s3] is set but storage backend is '{}'",
                self.backend.as_str()
            )));
        }

        if self.bucket.contains('/') || self.bucket == ".." || self.bucket == "." {
            return Err(ConfigError::Invalid(format!(
                "bucket name '{}' must be a single path segment",
                self.bucket
            )));
        }

        Ok(())
    }
}

impl StorageBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackendKind::S3 => "s3",
            StorageBackendKind::Filesystem => "filesystem",
            StorageBackendKind::Memory => "memory",
        }
    }
}

/// S3-compatible service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct S3StorageConfig {
    /// Service host, optionally with port and scheme, e.g.
    /// `s3.example.com` or `http://127.0.0.1:9000`
    #[validate(length(min = 1))]
    pub endpoint: String,

    #[validate(length(min = 1))]
    pub access_key: String,

    #[validate(length(min = 1))]
    pub secret_key: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Allow plain HTTP when the endpoint has no scheme
    #[serde(default)]
    pub allow_http: bool,
}

fn default_region() -> String { DEFAULT_S3_REGION.to_string() }

impl S3StorageConfig {
    pub fn new(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: default_region(),
            allow_http: false,
        }
    }

    /// Endpoint as a URL. A bare host gets `https://`, or `http://` when
    /// plain HTTP is allowed.
    pub fn endpoint_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.contains("://") {
            endpoint.to_string()
        } else if self.allow_http {
            format!("http://{endpoint}")
        } else {
            format!("https://{endpoint}")
        }
    }

    /// Whether requests may go out over plain HTTP
    pub fn is_http(&self) -> bool {
        self.endpoint_url().starts_with("http://")
    }
}
