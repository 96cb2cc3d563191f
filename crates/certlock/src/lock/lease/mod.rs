//! Lease-based locking on a shared key-value store.
//!
//! A lock is a single key holding the owner's token with an expiry. The
//! store's atomic set-if-absent is the only serialization point: exactly
//! one racer observes the claim succeeding, everybody else gets
//! [`LockError::Contention`] immediately. This backend never retries.
//!
//! Leases expire on their own, so a crashed process blocks a resource for
//! at most one TTL.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certlock_common::{LeaseToken, LockContext, ResourceName};
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use super::{LockHandle, Locker};
use crate::error::LockError;

pub use memory::MemoryLeaseStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisLeaseStore;

/// Prefix of every lease key in the shared store
pub const LEASE_KEY_PREFIX: &str = "certlock:lease:";

/// Atomic lease primitives of a shared key-value store
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    /// Store name used in logs and handles
    fn name(&self) -> &'static str;

    /// Store `token` under `key` for `ttl` unless a live lease exists.
    ///
    /// Returns `true` if the claim succeeded.
    async fn try_claim(&self, key: &str, token: &LeaseToken, ttl: Duration)
        -> Result<bool, LockError>;

    /// Delete `key` only if it currently holds `token`.
    ///
    /// Returns `true` if a lease was deleted.
    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LockError>;
}

/// Lock backend built on a [`LeaseStore`]
#[derive(Debug)]
pub struct LeaseLocker {
    store: Arc<dyn LeaseStore>,
    /// Leases obtained by this process and not yet released
    outstanding: DashMap<LeaseToken, ResourceName>,
}

impl LeaseLocker {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            outstanding: DashMap::new(),
        }
    }

    /// Number of leases this process obtained and has not released
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    fn lease_key(resource: &ResourceName) -> String {
        format!("{LEASE_KEY_PREFIX}{resource}")
    }
}

#[async_trait]
impl Locker for LeaseLocker {
    fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    async fn acquire(
        &self,
        ctx: &LockContext,
        resource: &ResourceName,
        ttl: Duration,
    ) -> Result<LockHandle, LockError> {
        if let Some(interrupt) = ctx.interrupted() {
            return Err(interrupt.into());
        }

        let key = Self::lease_key(resource);
        let token = LeaseToken::generate();

        let mut claim = {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            let token = token.clone();
            tokio::spawn(async move { store.try_claim(&key, &token, ttl).await })
        };

        let joined = tokio::select! {
            biased;
            joined = &mut claim => Ok(joined),
            interrupt = ctx.done() => Err(interrupt),
        };

        let claimed = match joined {
            Ok(joined) => joined
                .map_err(|e| LockError::Transport(format!("lease claim task failed: {e}")))??,
            Err(interrupt) => {
                // The claim may still land; give it back if it does
                let store = Arc::clone(&self.store);
                let resource = resource.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(true)) = claim.await {
                        debug!(resource = %resource, "Returning lease claimed after caller left");
                        if let Err(e) = store.release(&key, &token).await {
                            warn!(resource = %resource, error = %e, "Failed to return abandoned lease");
                        }
                    }
                });
                return Err(interrupt.into());
            }
        };

        if !claimed {
            debug!(resource = %resource, backend = self.store.name(), "Lease held by another owner");
            return Err(LockError::Contention {
                resource: resource.clone(),
            });
        }

        self.outstanding.insert(token.clone(), resource.clone());
        trace!(
            resource = %resource,
            ttl_secs = ttl.as_secs_f64(),
            "Lease obtained"
        );

        Ok(LockHandle::new(resource.clone(), token, self.store.name(), ttl))
    }

    async fn release(&self, ctx: &LockContext, handle: &LockHandle) -> Result<(), LockError> {
        if let Some(interrupt) = ctx.interrupted() {
            return Err(interrupt.into());
        }

        let key = Self::lease_key(&handle.resource);
        let released = tokio::select! {
            biased;
            released = self.store.release(&key, &handle.token) => released?,
            interrupt = ctx.done() => return Err(interrupt.into()),
        };

        // Only a definite answer from the store settles the lease; after a
        // failure it stays outstanding for shutdown to retry.
        self.outstanding.remove(&handle.token);

        if released {
            trace!(resource = %handle.resource, "Lease released");
            Ok(())
        } else {
            Err(LockError::NotHeld {
                resource: handle.resource.clone(),
                token: handle.token.clone(),
            })
        }
    }

    async fn shutdown(&self) {
        let leases: Vec<(LeaseToken, ResourceName)> = self
            .outstanding
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.outstanding.clear();

        if leases.is_empty() {
            return;
        }

        info!(count = leases.len(), "Releasing outstanding leases");
        for (token, resource) in leases {
            let key = Self::lease_key(&resource);
            match self.store.release(&key, &token).await {
                Ok(true) => debug!(resource = %resource, "Released outstanding lease"),
                Ok(false) => debug!(resource = %resource, "Outstanding lease already expired"),
                Err(e) => warn!(resource = %resource, error = %e, "Failed to release outstanding lease"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn shared_store() -> Arc<MemoryLeaseStore> {
        Arc::new(MemoryLeaseStore::new())
    }

    /// Memory store whose first release fails and whose claims can be slowed
    #[derive(Debug)]
    struct FlakyStore {
        inner: MemoryLeaseStore,
        fail_next_release: AtomicBool,
        claim_delay: Duration,
    }

    impl FlakyStore {
        fn new(claim_delay: Duration) -> Self {
            Self {
                inner: MemoryLeaseStore::new(),
                fail_next_release: AtomicBool::new(false),
                claim_delay,
            }
        }
    }

    #[async_trait]
    impl LeaseStore for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn try_claim(
            &self,
            key: &str,
            token: &LeaseToken,
            ttl: Duration,
        ) -> Result<bool, LockError> {
            tokio::time::sleep(self.claim_delay).await;
            self.inner.try_claim(key, token, ttl).await
        }

        async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LockError> {
            if self.fail_next_release.swap(false, Ordering::SeqCst) {
                return Err(LockError::Transport("connection reset".to_string()));
            }
            self.inner.release(key, token).await
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locker = LeaseLocker::new(shared_store());
        let ctx = LockContext::background();
        let resource = ResourceName::from("example.com/cert");

        let handle = locker
            .acquire(&ctx, &resource, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(handle.resource, resource);
        assert_eq!(handle.backend, "memory");
        assert_eq!(locker.outstanding_count(), 1);

        locker.release(&ctx, &handle).await.unwrap();
        assert_eq!(locker.outstanding_count(), 0);

        // Released resource can be taken again
        locker
            .acquire(&ctx, &resource, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mutual_exclusion_across_lockers() {
        let store = shared_store();
        let resource = ResourceName::from("example.com/cert");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locker = LeaseLocker::new(store.clone());
            let resource = resource.clone();
            tasks.push(tokio::spawn(async move {
                locker
                    .acquire(&LockContext::background(), &resource, Duration::from_secs(60))
                    .await
            }));
        }

        let mut obtained = 0;
        let mut contended = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => obtained += 1,
                Err(e) if e.is_contention() => contended += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(obtained, 1);
        assert_eq!(contended, 15);
    }

    #[tokio::test]
    async fn test_contention_is_immediate() {
        let store = shared_store();
        let a = LeaseLocker::new(store.clone());
        let b = LeaseLocker::new(store);
        let ctx = LockContext::background();
        let resource = ResourceName::from("r");

        a.acquire(&ctx, &resource, Duration::from_secs(60)).await.unwrap();
        let err = b
            .acquire(&ctx, &resource, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_release_with_foreign_token_keeps_lease() {
        let store = shared_store();
        let owner = LeaseLocker::new(store.clone());
        let intruder = LeaseLocker::new(store);
        let ctx = LockContext::background();
        let resource = ResourceName::from("r");

        let handle = owner
            .acquire(&ctx, &resource, Duration::from_secs(60))
            .await
            .unwrap();

        let forged = LockHandle {
            token: LeaseToken::generate(),
            ..handle.clone()
        };
        let err = intruder.release(&ctx, &forged).await.unwrap_err();
        assert!(err.is_benign());

        // The real lease is still in force
        let err = intruder
            .acquire(&ctx, &resource, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_contention());

        owner.release(&ctx, &handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_self_heals() {
        let store = shared_store();
        let crashed = LeaseLocker::new(store.clone());
        let other = LeaseLocker::new(store);
        let ctx = LockContext::background();
        let resource = ResourceName::from("r");

        let stale = crashed
            .acquire(&ctx, &resource, Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        other
            .acquire(&ctx, &resource, Duration::from_secs(60))
            .await
            .unwrap();

        // Releasing the stale handle must not free the new owner's lease
        let err = crashed.release(&ctx, &stale).await.unwrap_err();
        assert!(err.is_benign());
        let err = crashed
            .acquire(&ctx, &resource, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_shutdown_releases_outstanding_leases() {
        let store = shared_store();
        let locker = LeaseLocker::new(store.clone());
        let ctx = LockContext::background();

        for name in ["a", "b", "c"] {
            locker
                .acquire(&ctx, &ResourceName::from(name), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(locker.outstanding_count(), 3);

        locker.shutdown().await;
        assert_eq!(locker.outstanding_count(), 0);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_does_not_claim() {
        let store = shared_store();
        let locker = LeaseLocker::new(store.clone());
        let ctx = LockContext::background();
        ctx.cancel();

        let err = locker
            .acquire(&ctx, &ResourceName::from("r"), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_failed_release_stays_outstanding_for_shutdown() {
        let store = Arc::new(FlakyStore::new(Duration::ZERO));
        let locker = LeaseLocker::new(store.clone());
        let ctx = LockContext::background();

        let handle = locker
            .acquire(&ctx, &ResourceName::from("r"), Duration::from_secs(60))
            .await
            .unwrap();

        store.fail_next_release.store(true, Ordering::SeqCst);
        let err = locker.release(&ctx, &handle).await.unwrap_err();
        assert!(matches!(err, LockError::Transport(_)));
        assert_eq!(locker.outstanding_count(), 1);
        assert_eq!(store.inner.len(), 1);

        locker.shutdown().await;
        assert_eq!(locker.outstanding_count(), 0);
        assert_eq!(store.inner.len(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_release_stays_outstanding() {
        let store = shared_store();
        let locker = LeaseLocker::new(store.clone());

        let handle = locker
            .acquire(&LockContext::background(), &ResourceName::from("r"), Duration::from_secs(60))
            .await
            .unwrap();

        let cancelled = LockContext::background();
        cancelled.cancel();
        let err = locker.release(&cancelled, &handle).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(locker.outstanding_count(), 1);

        locker.shutdown().await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_claim_landing_after_deadline_is_returned() {
        let store = Arc::new(FlakyStore::new(Duration::from_millis(200)));
        let locker = LeaseLocker::new(store.clone());
        let resource = ResourceName::from("r");

        let err = locker
            .acquire(
                &LockContext::with_timeout(Duration::from_millis(50)),
                &resource,
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::DeadlineExceeded));
        assert_eq!(locker.outstanding_count(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.inner.len(), 0);

        // Nobody is left holding the resource
        locker
            .acquire(&LockContext::background(), &resource, Duration::from_secs(60))
            .await
            .unwrap();
    }
}
