//! In-process lease store with expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use certlock_common::LeaseToken;
use parking_lot::Mutex;

use super::LeaseStore;
use crate::error::LockError;

/// A lease record: owner token and expiry instant
#[derive(Debug, Clone)]
struct LeaseRecord {
    token: LeaseToken,
    expires_at: Instant,
}

impl LeaseRecord {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Lease store backed by a mutex-guarded map.
///
/// Share one instance (behind an `Arc`) between lockers to simulate
/// several processes coordinating through the same store.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live leases
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.leases.lock().values().filter(|r| r.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn try_claim(
        &self,
        key: &str,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if leases.get(key).is_some_and(|record| record.is_live(now)) {
            return Ok(false);
        }

        leases.insert(
            key.to_string(),
            LeaseRecord {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        match leases.get(key) {
            Some(record) if record.token == *token => {
                let live = record.is_live(now);
                leases.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryLeaseStore::new();
        let first = LeaseToken::generate();
        let second = LeaseToken::generate();

        assert!(store.try_claim("k", &first, Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_claim("k", &second, Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_claimed() {
        let store = MemoryLeaseStore::new();
        let first = LeaseToken::generate();
        let second = LeaseToken::generate();

        assert!(store.try_claim("k", &first, Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.is_empty());
        assert!(store.try_claim("k", &second, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = MemoryLeaseStore::new();
        let owner = LeaseToken::generate();
        let other = LeaseToken::generate();

        store.try_claim("k", &owner, Duration::from_secs(60)).await.unwrap();
        assert!(!store.release("k", &other).await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.release("k", &owner).await.unwrap());
        assert!(store.is_empty());
        assert!(!store.release("k", &owner).await.unwrap());
    }
}
