//! Distributed locking
//!
//! Serializes mutations of certificate material across every process that
//! shares a storage backend.
//!
//! # Architecture
//!
//! - [`Locker`] - Capability trait implemented by each coordination backend
//! - [`LeaseLocker`] - Atomic TTL lease in a shared key-value store, no
//!   internal retry
//! - [`MutexServiceLocker`] - Remote mutex service polled over HTTP until
//!   the mutex is obtained or the caller gives up
//! - [`LockRegistry`] - Process-wide table of held locks, released on
//!   shutdown
//!
//! Exactly one backend is active per configured instance; it is chosen at
//! startup by [`build_locker`].

mod lease;
mod mutex_service;
mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certlock_common::{LeaseToken, LockContext, ResourceName};
use certlock_config::{LockBackendKind, LockConfig};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::LockError;

pub use lease::{LeaseLocker, LeaseStore, MemoryLeaseStore, LEASE_KEY_PREFIX};
#[cfg(feature = "redis")]
pub use lease::RedisLeaseStore;
pub use mutex_service::{MutexServiceClient, MutexServiceLocker, MUTEX_API_PATH};
pub use registry::LockRegistry;

/// Default lease lifetime for locks taken through the storage facade
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// One process's claim over one resource.
///
/// A handle is only meaningful while its token matches the owner the
/// backend has recorded for the resource. Once the lease expires the
/// handle is stale and releasing it reports [`LockError::NotHeld`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Locked resource
    pub resource: ResourceName,
    /// Ownership token required to release the lease
    pub token: LeaseToken,
    /// Name of the backend that granted the lease
    pub backend: &'static str,
    /// Requested lease lifetime
    pub ttl: Duration,
    /// When the lease was granted
    pub acquired_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn new(
        resource: ResourceName,
        token: LeaseToken,
        backend: &'static str,
        ttl: Duration,
    ) -> Self {
        Self {
            resource,
            token,
            backend,
            ttl,
            acquired_at: Utc::now(),
        }
    }

    /// Whether the lease has outlived its TTL according to the local clock
    pub fn is_expired(&self) -> bool {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
            .is_some_and(|expires| Utc::now() >= expires)
    }
}

/// Pluggable coordination strategy behind one lock interface
#[async_trait]
pub trait Locker: Send + Sync + fmt::Debug {
    /// Backend name used in logs and handles
    fn backend_name(&self) -> &'static str;

    /// Acquire an exclusive lease on `resource` for `ttl`.
    ///
    /// Returns [`LockError::Cancelled`] or [`LockError::DeadlineExceeded`]
    /// when `ctx` fires first.
    async fn acquire(
        &self,
        ctx: &LockContext,
        resource: &ResourceName,
        ttl: Duration,
    ) -> Result<LockHandle, LockError>;

    /// Release the lease identified by `handle`.
    ///
    /// Never releases a lease owned by a different token.
    async fn release(&self, ctx: &LockContext, handle: &LockHandle) -> Result<(), LockError>;

    /// Release whatever the backend still tracks. Called once on shutdown.
    async fn shutdown(&self) {}
}

/// Build the configured lock backend
pub async fn build_locker(config: &LockConfig) -> Result<Arc<dyn Locker>, LockError> {
    let locker: Arc<dyn Locker> = match config.backend {
        LockBackendKind::Memory => Arc::new(LeaseLocker::new(Arc::new(MemoryLeaseStore::new()))),
        LockBackendKind::MutexService => {
            let service = config.mutex_service.as_ref().ok_or_else(|| {
                LockError::Config("mutex service backend selected but not configured".to_string())
            })?;
            let client = MutexServiceClient::new(
                &service.endpoint,
                &service.api_key,
                service.request_timeout(),
            )?;
            Arc::new(MutexServiceLocker::new(client).with_poll_interval(service.poll_interval()))
        }
        LockBackendKind::Lease => build_lease_locker(config).await?,
    };

    info!(
        backend = locker.backend_name(),
        ttl_secs = config.ttl_secs,
        "Initialized lock backend"
    );
    Ok(locker)
}

#[cfg(feature = "redis")]
async fn build_lease_locker(config: &LockConfig) -> Result<Arc<dyn Locker>, LockError> {
    let lease = config.lease.as_ref().ok_or_else(|| {
        LockError::Config("lease backend selected but not configured".to_string())
    })?;
    let store = RedisLeaseStore::connect(&lease.connection_url(), &lease.address).await?;
    Ok(Arc::new(LeaseLocker::new(Arc::new(store))))
}

#[cfg(not(feature = "redis"))]
async fn build_lease_locker(_config: &LockConfig) -> Result<Arc<dyn Locker>, LockError> {
    Err(LockError::Config(
        "lease backend requires the 'redis' feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use certlock_config::MutexServiceConfig;

    #[test]
    fn test_handle_expiry() {
        let fresh = LockHandle::new(
            ResourceName::from("a"),
            LeaseToken::generate(),
            "memory",
            Duration::from_secs(60),
        );
        assert!(!fresh.is_expired());

        let mut stale = fresh.clone();
        stale.acquired_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(stale.is_expired());
    }

    #[tokio::test]
    async fn test_build_memory_locker() {
        let locker = build_locker(&LockConfig::default()).await.unwrap();
        assert_eq!(locker.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_build_mutex_service_locker() {
        let config = LockConfig {
            backend: LockBackendKind::MutexService,
            mutex_service: Some(MutexServiceConfig::new("http://127.0.0.1:1", "key")),
            ..LockConfig::default()
        };
        let locker = build_locker(&config).await.unwrap();
        assert_eq!(locker.backend_name(), "mutex-service");
    }

    #[tokio::test]
    async fn test_build_requires_backend_table() {
        let config = LockConfig {
            backend: LockBackendKind::MutexService,
            ..LockConfig::default()
        };
        let err = build_locker(&config).await.unwrap_err();
        assert!(matches!(err, LockError::Config(_)));
    }
}
