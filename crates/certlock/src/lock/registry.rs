//! Process-wide table of held locks.
//!
//! The registry remembers the handle of every lock this process holds so
//! that `unlock` only needs the resource name, and so that shutdown can
//! release everything still outstanding.
//!
//! # Thread Safety
//!
//! Uses `DashMap`, so callers locking different resources never contend
//! on the table. No map guard is held across an `.await`.

use std::sync::Arc;
use std::time::Duration;

use certlock_common::{LockContext, ResourceName};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::{LockHandle, Locker, DEFAULT_LOCK_TTL};
use crate::error::LockError;

/// Upper bound for each release during shutdown cleanup
const CLEANUP_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Table of locks held by this process
#[derive(Debug)]
pub struct LockRegistry {
    locker: Arc<dyn Locker>,
    handles: DashMap<ResourceName, LockHandle>,
    ttl: Duration,
}

impl LockRegistry {
    /// Create a registry on top of `locker` using the default TTL
    pub fn new(locker: Arc<dyn Locker>) -> Self {
        Self {
            locker,
            handles: DashMap::new(),
            ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Set the lease lifetime used by [`lock`](Self::lock)
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn locker(&self) -> &Arc<dyn Locker> {
        &self.locker
    }

    /// Acquire `resource` with the registry's TTL
    pub async fn lock(&self, ctx: &LockContext, resource: &ResourceName) -> Result<(), LockError> {
        self.lock_with_ttl(ctx, resource, self.ttl).await
    }

    /// Acquire `resource` and remember its handle.
    ///
    /// Nothing is recorded when acquisition fails. If the table already
    /// holds a handle for `resource`, that handle is stale (the backend
    /// just granted the lease to us) and is released best-effort before
    /// being replaced.
    pub async fn lock_with_ttl(
        &self,
        ctx: &LockContext,
        resource: &ResourceName,
        ttl: Duration,
    ) -> Result<(), LockError> {
        info!(resource = %resource, backend = self.locker.backend_name(), "Lock");

        let handle = match self.locker.acquire(ctx, resource, ttl).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(resource = %resource, error = %e, "Lock error");
                return Err(e);
            }
        };

        if let Some(displaced) = self.handles.insert(resource.clone(), handle) {
            warn!(
                resource = %resource,
                acquired_at = %displaced.acquired_at,
                "Replacing stale lock handle"
            );
            let ctx = LockContext::with_timeout(CLEANUP_RELEASE_TIMEOUT);
            if let Err(e) = self.locker.release(&ctx, &displaced).await {
                debug!(resource = %resource, error = %e, "Stale lock handle was not released");
            }
        }

        Ok(())
    }

    /// Release `resource` if this process holds it.
    ///
    /// Unlocking a resource that is not held is a successful no-op. The
    /// entry is removed even when the backend reports an error, which is
    /// then returned.
    pub async fn unlock(&self, ctx: &LockContext, resource: &ResourceName) -> Result<(), LockError> {
        let Some((_, handle)) = self.handles.remove(resource) else {
            debug!(resource = %resource, "Unlock of a resource not held by this process");
            return Ok(());
        };

        info!(resource = %resource, "Release lock");
        self.locker.release(ctx, &handle).await
    }

    /// Whether this process holds a handle for `resource`
    pub fn is_held(&self, resource: &ResourceName) -> bool {
        self.handles.contains_key(resource)
    }

    /// Handle currently recorded for `resource`
    pub fn handle(&self, resource: &ResourceName) -> Option<LockHandle> {
        self.handles.get(resource).map(|h| h.clone())
    }

    /// Resources this process holds, sorted
    pub fn held(&self) -> Vec<ResourceName> {
        let mut held: Vec<ResourceName> = self.handles.iter().map(|e| e.key().clone()).collect();
        held.sort();
        held
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Release every held lock, ignoring individual failures.
    ///
    /// Called once at process shutdown. Returns the number of locks that
    /// were released successfully.
    pub async fn cleanup(&self) -> usize {
        let resources = self.held();
        let mut released = 0;

        for resource in resources {
            let Some((_, handle)) = self.handles.remove(&resource) else {
                continue;
            };

            info!(resource = %resource, "Release lock on cleanup");
            let ctx = LockContext::with_timeout(CLEANUP_RELEASE_TIMEOUT);
            match self.locker.release(&ctx, &handle).await {
                Ok(()) => released += 1,
                Err(e) => warn!(resource = %resource, error = %e, "Failed to release lock on cleanup"),
            }
        }

        self.locker.shutdown().await;
        released
    }
}
