//! In-memory object store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;

use super::{collect_listing, ObjectInfo, ObjectStore};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Object store keeping every bucket in an ordered in-process map
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects in `bucket`
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map_or(0, BTreeMap::len)
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        trace!(bucket = %bucket, key = %key, size = value.len(), "Put object");
        self.buckets.write().entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: value.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        if let Some(objects) = self.buckets.write().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| ObjectInfo {
                key: key.to_string(),
                size: object.data.len() as u64,
                modified: object.modified,
            })
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<String>, StorageError> {
        let buckets = self.buckets.read();
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(collect_listing(objects.keys(), prefix, recursive))
    }
}
