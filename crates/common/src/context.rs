//! Deadlines and cancellation for lock operations.
//!
//! Acquiring a lock from a remote service can block for an unbounded
//! amount of time. Every blocking lock call therefore takes a
//! [`LockContext`], which combines an optional deadline with an explicit
//! cancellation signal. Whichever fires first interrupts the call.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The cancellation signal was triggered
    Cancelled,
    /// The deadline elapsed
    DeadlineExceeded,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Cancelled => write!(f, "context cancelled"),
            Interrupt::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Deadline and cancellation signal for a lock call.
///
/// Cloning a context shares its cancellation signal.
#[derive(Debug, Clone)]
pub struct LockContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl LockContext {
    /// A context that never expires and is only cancelled explicitly
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context that is cancelled whenever `self` is, and expires at the
    /// earlier of the two deadlines.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Trigger the cancellation signal
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check without waiting whether the context is already done
    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.cancel.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context is cancelled or its deadline elapses.
    ///
    /// Never resolves for a background context that is not cancelled.
    pub async fn done(&self) -> Interrupt {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Interrupt::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupt::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                Interrupt::Cancelled
            }
        }
    }
}

impl Default for LockContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_fires() {
        let ctx = LockContext::with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.interrupted(), None);
        assert_eq!(ctx.done().await, Interrupt::DeadlineExceeded);
        assert_eq!(ctx.interrupted(), Some(Interrupt::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_wins_over_deadline() {
        let ctx = LockContext::with_timeout(Duration::from_secs(60));
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.done().await });
        ctx.cancel();
        assert_eq!(handle.await.unwrap(), Interrupt::Cancelled);
    }

    #[tokio::test]
    async fn test_child_inherits_cancellation_and_earliest_deadline() {
        let parent = LockContext::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.deadline().unwrap() <= parent.deadline().unwrap());

        let parent = LockContext::background();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.interrupted(), Some(Interrupt::Cancelled));
    }

    #[test]
    fn test_background_is_not_interrupted() {
        let ctx = LockContext::background();
        assert_eq!(ctx.interrupted(), None);
        assert!(ctx.deadline().is_none());
    }
}
