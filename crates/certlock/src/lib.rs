//! Certlock Library
//!
//! Durable, namespaced storage and cross-process mutual exclusion for
//! certificate management, shared by many server instances that may run
//! on different hosts.
//!
//! This library provides:
//!
//! - **Locking**: TTL-bounded exclusive leases on storage keys, backed by a
//!   shared key-value store or a remote mutex service
//! - **Lock Registry**: process-wide tracking of held locks with
//!   best-effort release on shutdown
//! - **Object Storage**: blob stores behind one trait (S3, filesystem, memory)
//! - **Namespacing**: isolation of several certificate stores in one bucket
//!
//! # Example
//!
//! ```ignore
//! use certlock::{CertStorage, LockContext};
//! use certlock_config::Config;
//!
//! let storage = CertStorage::from_config(&Config::from_file("certlock.toml")?).await?;
//!
//! storage.lock(&LockContext::with_timeout(Duration::from_secs(30)), "example.com/cert").await?;
//! storage.store("example.com/cert", &pem).await?;
//! storage.unlock("example.com/cert").await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod error;
pub mod lock;
pub mod storage;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{LockError, StorageError};

// Locking
pub use lock::{
    build_locker, LeaseLocker, LeaseStore, LockHandle, LockRegistry, Locker, MemoryLeaseStore,
    MutexServiceClient, MutexServiceLocker, DEFAULT_LOCK_TTL,
};
#[cfg(feature = "redis")]
pub use lock::RedisLeaseStore;

// Object storage
pub use store::{build_object_store, FsObjectStore, MemoryObjectStore, ObjectInfo, ObjectStore};
#[cfg(feature = "s3")]
pub use store::S3ObjectStore;

// Storage facade
pub use storage::{CertStorage, KeyInfo};

// Shared types
pub use certlock_common::{namespace, Interrupt, KeyNamespace, LeaseToken, LockContext, ResourceName};
