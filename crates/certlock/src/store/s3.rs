//! Object store on an S3-compatible service.
//!
//! One client is built per bucket on first use and reused afterwards.
//! Keys map one to one onto object paths.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use certlock_common::SEPARATOR;
use certlock_config::S3StorageConfig;
use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::ObjectStore as RemoteStore;
use tracing::{debug, trace};

use super::{collect_listing, ObjectInfo, ObjectStore};
use crate::error::StorageError;

/// Object store backed by an S3-compatible service
pub struct S3ObjectStore {
    settings: Option<S3StorageConfig>,
    clients: DashMap<String, Arc<dyn RemoteStore>>,
}

impl S3ObjectStore {
    pub fn new(settings: S3StorageConfig) -> Self {
        Self {
            settings: Some(settings),
            clients: DashMap::new(),
        }
    }

    /// Serve `bucket` from an already built client
    pub fn with_client(bucket: impl Into<String>, client: Arc<dyn RemoteStore>) -> Self {
        let clients = DashMap::new();
        clients.insert(bucket.into(), client);
        Self {
            settings: None,
            clients,
        }
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn RemoteStore>, StorageError> {
        if let Some(client) = self.clients.get(bucket) {
            return Ok(Arc::clone(client.value()));
        }

        let settings = self.settings.as_ref().ok_or_else(|| {
            StorageError::Config(format!("no object store client for bucket '{bucket}'"))
        })?;

        let client = AmazonS3Builder::new()
            .with_endpoint(settings.endpoint_url())
            .with_region(&settings.region)
            .with_bucket_name(bucket)
            .with_access_key_id(&settings.access_key)
            .with_secret_access_key(&settings.secret_key)
            .with_allow_http(settings.is_http())
            .build()
            .map_err(|e| StorageError::Config(format!("s3 client for bucket '{bucket}': {e}")))?;

        debug!(
            endpoint = %settings.endpoint_url(),
            bucket,
            "Created S3 client"
        );
        let client: Arc<dyn RemoteStore> = Arc::new(client);
        Ok(Arc::clone(&self.clients.entry(bucket.to_string()).or_insert(client)))
    }

    fn object_path(key: &str) -> Result<Path, StorageError> {
        if key.is_empty() || key.ends_with(SEPARATOR) {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "object keys must name a file",
            });
        }
        Path::parse(key).map_err(|_| StorageError::InvalidKey {
            key: key.to_string(),
            reason: "not a valid object path",
        })
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

fn backend_error(operation: &str, key: &str, e: object_store::Error) -> StorageError {
    StorageError::Backend(format!("{operation} '{key}': {e}"))
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("endpoint", &self.settings.as_ref().map(|s| s.endpoint_url()))
            .field("buckets", &self.clients.len())
            .finish()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = Self::object_path(key)?;
        self.client(bucket)?
            .put(&path, value.to_vec().into())
            .await
            .map_err(|e| backend_error("put", key, e))?;
        trace!(bucket, key, size = value.len(), "Put object");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = Self::object_path(key)?;
        let result = match self.client(bucket)?.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Err(Self::not_found(bucket, key)),
            Err(e) => return Err(backend_error("get", key, e)),
        };
        let bytes = result.bytes().await.map_err(|e| backend_error("get", key, e))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = Self::object_path(key)?;
        match self.client(bucket)?.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(backend_error("delete", key, e)),
        }
    }

    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let path = Self::object_path(key)?;
        match self.client(bucket)?.head(&path).await {
            Ok(meta) => Ok(ObjectInfo {
                key: meta.location.to_string(),
                size: meta.size as u64,
                modified: meta.last_modified,
            }),
            Err(object_store::Error::NotFound { .. }) => Err(Self::not_found(bucket, key)),
            Err(e) => Err(backend_error("stat", key, e)),
        }
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<String>, StorageError> {
        let client = self.client(bucket)?;

        // Object paths match whole segments, so list from the directory
        // part and filter the rest by string prefix.
        let dir = prefix.rfind(SEPARATOR).map_or("", |idx| &prefix[..idx]);
        let dir = if dir.is_empty() {
            None
        } else {
            Some(Path::parse(dir).map_err(|_| StorageError::InvalidKey {
                key: prefix.to_string(),
                reason: "not a valid object path",
            })?)
        };

        let objects: Vec<_> = client
            .list(dir.as_ref())
            .try_collect()
            .await
            .map_err(|e| backend_error("list", prefix, e))?;

        let keys = objects
            .iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| !key.ends_with(SEPARATOR));
        Ok(collect_listing(keys, prefix, recursive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    const BUCKET: &str = "certificates";

    fn store() -> S3ObjectStore {
        S3ObjectStore::with_client(BUCKET, Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_put_get_stat_delete() {
        let store = store();
        let data = vec![7u8; 1200];

        store.put(BUCKET, "ssl/example.com/cert", &data).await.unwrap();
        assert_eq!(store.get(BUCKET, "ssl/example.com/cert").await.unwrap(), data);

        let info = store.stat(BUCKET, "ssl/example.com/cert").await.unwrap();
        assert_eq!(info.key, "ssl/example.com/cert");
        assert_eq!(info.size, 1200);

        store.delete(BUCKET, "ssl/example.com/cert").await.unwrap();
        // Idempotent
        store.delete(BUCKET, "ssl/example.com/cert").await.unwrap();
        assert!(store.get(BUCKET, "ssl/example.com/cert").await.unwrap_err().is_not_found());
        assert!(store.stat(BUCKET, "ssl/example.com/cert").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list() {
        let store = store();
        for key in [
            "ssl/certificates/a.com/a.com.crt",
            "ssl/certificates/b.com/b.com.crt",
            "ssl/acme/account.json",
            "ssl/README",
            "other/README",
        ] {
            store.put(BUCKET, key, b"x").await.unwrap();
        }

        assert_eq!(
            store.list(BUCKET, "ssl/", false).await.unwrap(),
            vec!["ssl/README", "ssl/acme/", "ssl/certificates/"]
        );
        assert_eq!(
            store.list(BUCKET, "ssl/certificates/", true).await.unwrap(),
            vec!["ssl/certificates/a.com/a.com.crt", "ssl/certificates/b.com/b.com.crt"]
        );
        // Partial segment prefixes match by string
        assert_eq!(
            store.list(BUCKET, "ssl/ac", true).await.unwrap(),
            vec!["ssl/acme/account.json"]
        );
        assert_eq!(store.list(BUCKET, "", true).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let store = store();
        for key in ["", "ssl/", "ssl/../etc/passwd"] {
            let err = store.put(BUCKET, key, b"x").await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey { .. }), "{key}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_unknown_bucket_without_settings() {
        let err = store().get("elsewhere", "key").await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_clients_built_per_bucket() {
        let settings = S3StorageConfig {
            allow_http: true,
            ..S3StorageConfig::new("127.0.0.1:9000", "access", "secret")
        };
        let store = S3ObjectStore::new(settings);

        let first = store.client("certs").unwrap();
        let again = store.client("certs").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        store.client("other").unwrap();
        assert_eq!(store.clients.len(), 2);
    }
}
