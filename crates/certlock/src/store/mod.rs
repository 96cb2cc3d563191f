//! Object storage collaborators.
//!
//! Certificate material is kept as opaque byte blobs under string keys in
//! a bucket. The [`ObjectStore`] trait is the boundary to whatever holds
//! the blobs; this crate ships an S3-compatible store, a filesystem store
//! and an in-memory store.

mod filesystem;
mod memory;
#[cfg(feature = "s3")]
mod s3;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use certlock_common::SEPARATOR;
use certlock_config::{StorageBackendKind, StorageConfig};
use chrono::{DateTime, Utc};

use crate::error::StorageError;

pub use filesystem::FsObjectStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    /// Size in bytes
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Blob storage under a bucket/key namespace
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Store `value` under `key`, replacing any existing object
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Read the object under `key`
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete the object under `key`. Deleting a missing object succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError>;

    /// Keys starting with `prefix`, in order.
    ///
    /// Without `recursive`, keys nested deeper than the prefix are
    /// collapsed into directory markers ending in `/`.
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool)
        -> Result<Vec<String>, StorageError>;
}

/// Build the configured object store
pub fn build_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match config.backend {
        StorageBackendKind::Memory => Ok(Arc::new(MemoryObjectStore::new())),
        StorageBackendKind::Filesystem => {
            let root = config.root.as_ref().ok_or_else(|| {
                StorageError::Config("filesystem storage requires a root directory".to_string())
            })?;
            Ok(Arc::new(FsObjectStore::new(root)?))
        }
        StorageBackendKind::S3 => build_s3_store(config),
    }
}

#[cfg(feature = "s3")]
fn build_s3_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let settings = config.s3.clone().ok_or_else(|| {
        StorageError::Config("s3 storage selected but not configured".to_string())
    })?;
    Ok(Arc::new(S3ObjectStore::new(settings)))
}

#[cfg(not(feature = "s3"))]
fn build_s3_store(_config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    Err(StorageError::Config(
        "s3 storage requires the 's3' feature".to_string(),
    ))
}

/// Filter `keys` down to a listing of `prefix`.
///
/// Shared by the store implementations so both list the same way.
pub(crate) fn collect_listing<I>(keys: I, prefix: &str, recursive: bool) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut listing = BTreeSet::new();
    for key in keys {
        let key = key.as_ref();
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };

        match rest.find(SEPARATOR) {
            Some(idx) if !recursive => {
                listing.insert(format!("{prefix}{}", &rest[..=idx]));
            }
            _ => {
                listing.insert(key.to_string());
            }
        }
    }
    listing.into_iter().collect()
}
