//! Certificate storage facade.
//!
//! [`CertStorage`] is the single object handed to the certificate manager.
//! It combines a namespaced object store with the lock registry: the
//! manager locks a key, reads and writes through the store, then unlocks.
//! Every key, lock names included, is placed under the configured prefix,
//! so stores sharing a bucket or a coordination backend never collide.

use std::sync::Arc;

use certlock_common::{KeyNamespace, LockContext, ResourceName, SEPARATOR};
use certlock_config::Config;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{LockError, StorageError};
use crate::lock::{build_locker, LockRegistry, Locker};
use crate::store::{build_object_store, ObjectStore};

/// Metadata returned by [`CertStorage::stat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: String,
    pub modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    /// `true` for an object, `false` for a directory marker
    pub is_terminal: bool,
}

/// Namespaced, lock-guarded certificate storage
#[derive(Debug)]
pub struct CertStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    namespace: KeyNamespace,
    locks: LockRegistry,
}

impl CertStorage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        locks: LockRegistry,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            namespace: KeyNamespace::new(prefix),
            locks,
        }
    }

    /// Build the object store and lock backend described by `config`
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        let store = build_object_store(&config.storage)?;
        let locker: Arc<dyn Locker> = build_locker(&config.lock).await?;
        let locks = LockRegistry::new(locker).with_ttl(config.lock.ttl());

        info!(
            bucket = %config.storage.bucket,
            prefix = %config.storage.prefix,
            "Initialized certificate storage"
        );

        Ok(Self::new(
            store,
            config.storage.bucket.clone(),
            config.storage.prefix.clone(),
            locks,
        ))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        self.namespace.prefix()
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.locks
    }

    /// Namespace a key under this store's prefix
    pub fn key_prefix(&self, key: &str) -> String {
        self.namespace.apply(key)
    }

    fn resource(&self, key: &str) -> ResourceName {
        ResourceName::new(self.key_prefix(key))
    }

    /// Acquire the lock guarding `key`, waiting as long as `ctx` allows
    pub async fn lock(&self, ctx: &LockContext, key: &str) -> Result<(), LockError> {
        self.locks.lock(ctx, &self.resource(key)).await
    }

    /// Release the lock guarding `key`.
    ///
    /// Unlocking a key that is not held, or whose lease already expired,
    /// succeeds.
    pub async fn unlock(&self, key: &str) -> Result<(), LockError> {
        let resource = self.resource(key);
        match self.locks.unlock(&LockContext::background(), &resource).await {
            Err(e) if e.is_benign() => {
                warn!(resource = %resource, error = %e, "Lock was no longer held");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = self.key_prefix(key);
        info!(key = %key, size = value.len(), "Store");
        self.store.put(&self.bucket, &key, value).await
    }

    pub async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.key_prefix(key);
        info!(key = %key, "Load");
        self.store.get(&self.bucket, &key).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = self.key_prefix(key);
        info!(key = %key, "Delete");
        self.store.delete(&self.bucket, &key).await
    }

    /// Whether an object exists under `key`. Any stat failure counts as
    /// absent.
    pub async fn exists(&self, key: &str) -> bool {
        let key = self.key_prefix(key);
        debug!(key = %key, "Exists");
        self.store.stat(&self.bucket, &key).await.is_ok()
    }

    /// Object keys below `prefix`, excluding directory markers
    pub async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let prefix = self.namespace.apply_dir(prefix);
        debug!(prefix = %prefix, recursive, "List");

        let keys = self.store.list(&self.bucket, &prefix, recursive).await?;
        Ok(keys
            .into_iter()
            .filter(|key| !key.ends_with(SEPARATOR))
            .collect())
    }

    pub async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        let key = self.key_prefix(key);
        info!(key = %key, "Stat");

        let object = self.store.stat(&self.bucket, &key).await?;
        Ok(KeyInfo {
            is_terminal: !object.key.ends_with(SEPARATOR),
            key: object.key,
            modified: object.modified,
            size: object.size,
        })
    }

    /// Release every lock this process still holds.
    ///
    /// Best-effort; call once on shutdown.
    pub async fn cleanup(&self) {
        info!(held = self.locks.len(), "Storage cleanup");
        let released = self.locks.cleanup().await;
        debug!(released, "Released locks on cleanup");
    }
}
