//! Filesystem object store
//!
//! Maps buckets to directories and keys to relative file paths below them.
//!
//! # Directory Structure
//!
//! ```text
//! root/
//! └── certificates/                 # bucket
//!     └── ssl/                      # key prefix
//!         └── certificates/
//!             └── example.com/
//!                 ├── example.com.crt
//!                 └── example.com.key
//! ```

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

use super::{collect_listing, ObjectInfo, ObjectStore};
use crate::error::StorageError;
use certlock_common::SEPARATOR;

/// Suffix of in-progress writes, never listed as objects
const TEMP_SUFFIX: &str = ".tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Object store on a directory tree.
///
/// Directories are created with 0700 and files with 0600 permissions on
/// Unix, since the tree holds private keys. Objects are written to a
/// temporary sibling and renamed into place, so readers never observe a
/// partial object.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;
        }

        info!(storage_path = %root.display(), "Initialized filesystem object store");

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        if bucket.is_empty() || bucket.contains(SEPARATOR) || bucket == "." || bucket == ".." {
            return Err(StorageError::InvalidKey {
                key: bucket.to_string(),
                reason: "bucket must be a single path segment",
            });
        }
        Ok(self.root.join(bucket))
    }

    /// Resolve `key` to a path inside the bucket, rejecting traversal
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = |reason| StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        };

        if key.is_empty() || key.ends_with(SEPARATOR) {
            return Err(invalid("key must name an object"));
        }

        let mut path = self.bucket_path(bucket)?;
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(invalid("key must be a relative path without '..'")),
            }
        }
        Ok(path)
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    fn map_not_found(e: io::Error, bucket: &str, key: &str) -> StorageError {
        if e.kind() == io::ErrorKind::NotFound {
            Self::not_found(bucket, key)
        } else {
            StorageError::Io(e)
        }
    }
}

/// Hidden sibling of `path` used while writing it
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{n}{TEMP_SUFFIX}", std::process::id()))
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

async fn write_file(path: &Path, value: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(value).await?;
    file.sync_all().await
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            set_dir_permissions(parent).await?;
        }

        let temp = temp_path(&path);
        let written = match write_file(&temp, value).await {
            Ok(()) => tokio::fs::rename(&temp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), error = %cleanup, "Failed to remove partial write");
                }
            }
            return Err(StorageError::Io(e));
        }

        debug!(bucket = %bucket, key = %key, size = value.len(), "Wrote object");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(e, bucket, key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(bucket = %bucket, key = %key, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(bucket = %bucket, key = %key, "Object to delete not found");
                Ok(())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let path = self.object_path(bucket, key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::map_not_found(e, bucket, key))?;
        if !metadata.is_file() {
            return Err(Self::not_found(bucket, key));
        }

        Ok(ObjectInfo {
            key: key.to_string(),
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<String>, StorageError> {
        let bucket_path = self.bucket_path(bucket)?;
        let keys = walk(&bucket_path).await?;
        Ok(collect_listing(keys, prefix, recursive))
    }
}

/// Collect every file below `root` as a `/`-separated key. A missing
/// root holds no keys.
async fn walk(root: &Path) -> Result<Vec<String>, StorageError> {
    let mut keys = Vec::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, key_prefix)) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir.as_path() == root => return Ok(keys),
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let key = format!("{key_prefix}{name}");

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), format!("{key}{SEPARATOR}")));
            } else if file_type.is_file() && !is_temp_file(&name) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

async fn set_dir_permissions(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, fs::Permissions::from_mode(0o700)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
