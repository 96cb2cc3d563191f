//! Locking through a remote mutex service.
//!
//! The service is the single source of truth for lease state. Acquiring
//! asks the service for the mutex and, while somebody else holds it, asks
//! again after a fixed pause until the service grants it, the caller's
//! context fires, or a request fails.
//!
//! # Wire contract
//!
//! ```text
//! GET    {endpoint}/api/v1/mutex?api_key=..&resource_name=..&ttl=<secs>
//!        200 {"obtained": bool, "uuid": string}
//! DELETE {endpoint}/api/v1/mutex?api_key=..&resource_name=..&uuid=..
//!        200 {"released": bool}
//! ```
//!
//! Any other status is a [`LockError::Protocol`].
//!
//! # Cancellation
//!
//! Each call runs the network exchange as a spawned task that reports
//! through a oneshot channel, and races it against the caller's context.
//! When the context wins, the task is told to stop. At most one request
//! is ever in flight per call. A request that is already in flight is
//! allowed to finish, and a mutex it obtains after the caller left is
//! handed back to the service instead of being leaked.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use certlock_common::{LeaseToken, LockContext, ResourceName};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{LockHandle, Locker};
use crate::error::LockError;

/// Path of the mutex resource on the service
pub const MUTEX_API_PATH: &str = "/api/v1/mutex";

/// Default pause between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const BACKEND_NAME: &str = "mutex-service";

#[derive(Debug, Deserialize)]
struct ObtainMutexResponse {
    obtained: bool,
    #[serde(default)]
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseMutexResponse {
    released: bool,
}

/// HTTP client for the mutex service
#[derive(Clone)]
pub struct MutexServiceClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl MutexServiceClient {
    /// Create a client for the service at `endpoint`
    pub fn new(endpoint: &str, api_key: &str, request_timeout: Duration) -> Result<Self, LockError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LockError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn mutex_url(&self) -> String {
        format!("{}{}", self.endpoint, MUTEX_API_PATH)
    }

    /// Ask the service for the mutex once.
    ///
    /// Returns the ownership token if obtained, `None` if the mutex is
    /// held by somebody else.
    pub async fn obtain(
        &self,
        resource: &ResourceName,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, LockError> {
        // The service works in whole seconds
        let ttl_secs = ttl.as_secs().max(1).to_string();

        let response = self
            .http
            .get(self.mutex_url())
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("resource_name", resource.as_str()),
                ("ttl", ttl_secs.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.transport_error("obtain mutex", e))?;

        let body: ObtainMutexResponse = self.decode("obtain mutex", response).await?;
        if !body.obtained {
            return Ok(None);
        }
        if body.uuid.is_empty() {
            return Err(LockError::Decode(format!(
                "mutex for '{resource}' reported obtained without a uuid"
            )));
        }
        Ok(Some(LeaseToken::from_string(body.uuid)))
    }

    /// Ask the service to release the mutex held with `token`
    pub async fn release(&self, resource: &ResourceName, token: &LeaseToken) -> Result<(), LockError> {
        let response = self
            .http
            .delete(self.mutex_url())
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("resource_name", resource.as_str()),
                ("uuid", token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.transport_error("release mutex", e))?;

        let body: ReleaseMutexResponse = self.decode("release mutex", response).await?;
        if body.released {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                resource: resource.clone(),
                token: token.clone(),
            })
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T, LockError> {
        let status = response.status();
        if status != StatusCode::OK {
            warn!(
                endpoint = %self.endpoint,
                status = status.as_u16(),
                operation,
                "Unexpected status from mutex service"
            );
            return Err(LockError::Protocol {
                operation,
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(operation, e))?;
        serde_json::from_slice(&body)
            .map_err(|e| LockError::Decode(format!("{operation} response from {}: {e}", self.endpoint)))
    }

    fn transport_error(&self, operation: &str, e: reqwest::Error) -> LockError {
        LockError::Transport(format!("{operation} on {}: {e}", self.endpoint))
    }
}

impl fmt::Debug for MutexServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexServiceClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Lock backend that polls a remote mutex service
#[derive(Debug, Clone)]
pub struct MutexServiceLocker {
    client: MutexServiceClient,
    poll_interval: Duration,
}

impl MutexServiceLocker {
    pub fn new(client: MutexServiceClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the pause between polls
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn client(&self) -> &MutexServiceClient {
        &self.client
    }
}

/// Poll until the mutex is obtained, a request fails, or `stop` fires
async fn poll_until_obtained(
    client: &MutexServiceClient,
    resource: &ResourceName,
    ttl: Duration,
    poll_interval: Duration,
    stop: &CancellationToken,
) -> Result<LeaseToken, LockError> {
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        if let Some(token) = client.obtain(resource, ttl).await? {
            debug!(resource = %resource, attempts, "Mutex obtained");
            return Ok(token);
        }

        trace!(resource = %resource, attempts, "Mutex held elsewhere, waiting");
        tokio::select! {
            _ = stop.cancelled() => return Err(LockError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[async_trait]
impl Locker for MutexServiceLocker {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
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

        let (tx, rx) = oneshot::channel();
        let stop = CancellationToken::new();
        // Stops the poller however this call returns
        let _stop_guard = stop.clone().drop_guard();

        let client = self.client.clone();
        let poll_resource = resource.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let outcome =
                poll_until_obtained(&client, &poll_resource, ttl, poll_interval, &stop).await;
            if let Err(Ok(token)) = tx.send(outcome) {
                // Caller gave up while the last request was in flight
                debug!(resource = %poll_resource, "Returning mutex obtained after caller left");
                if let Err(e) = client.release(&poll_resource, &token).await {
                    warn!(resource = %poll_resource, error = %e, "Failed to return abandoned mutex");
                }
            }
        });

        tokio::select! {
            biased;
            outcome = rx => {
                let token = outcome.map_err(|_| {
                    LockError::Transport("mutex polling task ended without a result".to_string())
                })??;
                Ok(LockHandle::new(resource.clone(), token, BACKEND_NAME, ttl))
            }
            interrupt = ctx.done() => {
                debug!(resource = %resource, reason = %interrupt, "Stopped waiting for mutex");
                Err(interrupt.into())
            }
        }
    }

    async fn release(&self, ctx: &LockContext, handle: &LockHandle) -> Result<(), LockError> {
        if let Some(interrupt) = ctx.interrupted() {
            return Err(interrupt.into());
        }

        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let resource = handle.resource.clone();
        let token = handle.token.clone();
        tokio::spawn(async move {
            let _ = tx.send(client.release(&resource, &token).await);
        });

        tokio::select! {
            biased;
            outcome = rx => outcome.map_err(|_| {
                LockError::Transport("mutex release task ended without a result".to_string())
            })?,
            interrupt = ctx.done() => Err(interrupt.into()),
        }
    }
}
