//! Cancellation and deadline propagation.
//!
//! A single [`CancelToken`] threads from a batch down through every pipeline
//! and validator. Child tokens observe their parents, so canceling a batch
//! reaches every worker, while a worker canceling its own token leaves its
//! siblings alone.

use crate::error::{Error, Result};
use core::time::Duration;
use futures::future::select_all;
use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// Cooperative cancellation signal backed by `tokio::sync::watch` channels.
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// Signal owned by this token
    own: Arc<watch::Sender<bool>>,
    /// Signals of every ancestor token
    ancestors: Vec<watch::Receiver<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a fresh, uncanceled root token.
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            own: Arc::new(sender),
            ancestors: Vec::new(),
        }
    }

    /// Create a child token that is canceled when this token is.
    #[must_use]
    pub fn child(&self) -> Self {
        let (sender, _receiver) = watch::channel(false);
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.own.subscribe());
        Self {
            own: Arc::new(sender),
            ancestors,
        }
    }

    /// Cancel this token and every child derived from it.
    pub fn cancel(&self) {
        self.own.send_replace(true);
    }

    /// Whether this token or any ancestor has been canceled.
    pub fn is_cancelled(&self) -> bool {
        *self.own.borrow() || self.ancestors.iter().any(|receiver| *receiver.borrow())
    }

    /// Resolve once this token or any ancestor is canceled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }

        let mut receivers = self.ancestors.clone();
        receivers.push(self.own.subscribe());

        let waits: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = receivers
            .into_iter()
            .map(|mut receiver| {
                Box::pin(async move {
                    if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
                        // Sender dropped without canceling: this signal never fires.
                        pending::<()>().await;
                    }
                }) as Pin<Box<dyn Future<Output = ()> + Send>>
            })
            .collect();

        select_all(waits).await;
    }
}

/// Per-run execution context handed to every validator.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Cancellation signal for this run
    pub cancel: CancelToken,
    /// Hard deadline for this run
    pub deadline: Instant,
    /// Configured run timeout in milliseconds, reported on expiry
    pub timeout_ms: u64,
}

impl RunContext {
    /// Create a context that expires after `timeout`.
    pub fn new(cancel: CancelToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Time left before the deadline (zero once elapsed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Fail fast when the run is already canceled or out of time.
    ///
    /// # Errors
    /// Returns `Error::Canceled` or `Error::Timeout` accordingly.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        if self.remaining().is_zero() {
            return Err(Error::Timeout(self.timeout_ms));
        }
        Ok(())
    }

    /// Drive `future` to completion unless the run is canceled or the deadline passes.
    ///
    /// Dropping the future on cancellation also drops any child process it
    /// owns; processes spawned with `kill_on_drop` are killed, not orphaned.
    ///
    /// # Errors
    /// Returns `Error::Canceled` or `Error::Timeout` when interrupted,
    /// otherwise whatever `future` returns.
    pub async fn guard<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Canceled),
            () = sleep_until(self.deadline) => Err(Error::Timeout(self.timeout_ms)),
            outcome = future => outcome,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_child_observes_parent_cancel() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        grandchild.cancelled().await;
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("waiter should wake")
            .expect("join waiter");
    }

    #[tokio::test]
    async fn test_guard_times_out() {
        let context = RunContext::new(CancelToken::new(), Duration::from_millis(20));
        let outcome = context
            .guard(async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(outcome, Err(Error::Timeout(20))));
    }

    #[tokio::test]
    async fn test_guard_returns_canceled() {
        let token = CancelToken::new();
        token.cancel();
        let context = RunContext::new(token, Duration::from_secs(5));
        let outcome: Result<()> = context.guard(async { Ok(()) }).await;
        assert!(matches!(outcome, Err(Error::Canceled)));
        assert!(matches!(context.check(), Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_guard_passes_through_result() {
        let context = RunContext::new(CancelToken::new(), Duration::from_secs(5));
        let outcome = context.guard(async { Ok(42) }).await;
        assert_eq!(outcome.ok(), Some(42));
    }
}
