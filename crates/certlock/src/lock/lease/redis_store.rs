//! Redis-compatible lease store.
//!
//! Claims use `SET key token NX PX ttl`, so the server's own key expiry
//! frees abandoned leases. Release runs a compare-and-delete script so a
//! token can only ever delete its own lease.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use certlock_common::LeaseToken;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{info, trace};

use super::LeaseStore;
use crate::error::LockError;

static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        else
            return 0
        end
        "#,
    )
});

/// Lease store on a Redis-compatible server
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    address: String,
}

impl RedisLeaseStore {
    /// Connect to the store at `url` (`redis://[user][:password@]host:port/db`).
    ///
    /// `address` is only used for logging, so credentials never reach
    /// the logs.
    pub async fn connect(url: &str, address: &str) -> Result<Self, LockError> {
        let client = Client::open(url)
            .map_err(|e| LockError::Config(format!("invalid lease store address: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            LockError::Transport(format!("failed to connect to lease store {address}: {e}"))
        })?;

        info!(address = %address, "Connected to lease store");

        Ok(Self {
            conn,
            address: address.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn transport_error(&self, operation: &str, e: redis::RedisError) -> LockError {
        LockError::Transport(format!("lease store {} {operation} failed: {e}", self.address))
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn try_claim(
        &self,
        key: &str,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.transport_error("SET NX", e))?;

        trace!(key = %key, obtained = reply.is_some(), "Lease claim");
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        let deleted: i64 = RELEASE_SCRIPT
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport_error("release", e))?;

        trace!(key = %key, released = deleted == 1, "Lease release");
        Ok(deleted == 1)
    }
}

impl fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLeaseStore")
            .field("address", &self.address)
            .finish()
    }
}
