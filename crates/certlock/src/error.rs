//! Error types for locking and storage.

use certlock_common::{Interrupt, LeaseToken, ResourceName};
use thiserror::Error;

/// Errors raised by lock backends and the lock registry
#[derive(Debug, Error)]
pub enum LockError {
    /// The resource is held by another owner
    #[error("lock on '{resource}' is held by another owner")]
    Contention { resource: ResourceName },

    /// The coordination backend could not be reached
    #[error("transport error: {0}")]
    Transport(String),

    /// The mutex service answered with an unexpected status code
    #[error("{operation}: got status code {status}, but expected 200 on endpoint {endpoint}")]
    Protocol {
        operation: &'static str,
        endpoint: String,
        status: u16,
    },

    /// A response body could not be decoded
    #[error("malformed response: {0}")]
    Decode(String),

    /// The caller cancelled the operation
    #[error("lock operation cancelled")]
    Cancelled,

    /// The caller's deadline elapsed before the operation finished
    #[error("lock operation deadline exceeded")]
    DeadlineExceeded,

    /// The token does not own the resource (never held, released or expired)
    #[error("could not release resource '{resource}' with token '{token}': not held")]
    NotHeld {
        resource: ResourceName,
        token: LeaseToken,
    },

    /// The backend is misconfigured
    #[error("lock configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// Resource is held elsewhere; retrying later may succeed
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::Contention { .. })
    }

    /// The caller gave up (cancellation or deadline)
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LockError::Cancelled | LockError::DeadlineExceeded)
    }

    /// Releasing something that is no longer held
    pub fn is_benign(&self) -> bool {
        matches!(self, LockError::NotHeld { .. })
    }

    /// Whether a caller may reasonably retry the same call
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Contention { .. } | LockError::Transport(_))
    }
}

impl From<Interrupt> for LockError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => LockError::Cancelled,
            Interrupt::DeadlineExceeded => LockError::DeadlineExceeded,
        }
    }
}

/// Errors raised by object stores and the certificate storage facade
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object under this key
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Key cannot be mapped to an object
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage misconfiguration
    #[error("storage configuration error: {0}")]
    Config(String),

    /// Remote object service failure
    #[error("object store error: {0}")]
    Backend(String),

    /// Lock failure surfaced through the storage facade
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let contention = LockError::Contention {
            resource: ResourceName::from("a"),
        };
        assert!(contention.is_contention());
        assert!(contention.is_retryable());
        assert!(!contention.is_cancellation());

        let deadline = LockError::from(Interrupt::DeadlineExceeded);
        assert!(deadline.is_cancellation());
        assert!(!deadline.is_contention());
        assert!(!deadline.is_retryable());

        let not_held = LockError::NotHeld {
            resource: ResourceName::from("a"),
            token: LeaseToken::from_string("t"),
        };
        assert!(not_held.is_benign());
    }

    #[test]
    fn test_protocol_error_names_status_and_endpoint() {
        let err = LockError::Protocol {
            operation: "obtain mutex",
            endpoint: "https://mutex.example.com".to_string(),
            status: 503,
        };
        let msg = err.to_string();
        assert!(msg.contains("503"));
        assert!(msg.contains("https://mutex.example.com"));
    }

    #[test]
    fn test_not_held_names_resource_and_token() {
        let err = LockError::NotHeld {
            resource: ResourceName::from("ssl/example.com"),
            token: LeaseToken::from_string("abc-123"),
        };
        let msg = err.to_string();
        assert!(msg.contains("ssl/example.com"));
        assert!(msg.contains("abc-123"));
    }
}
