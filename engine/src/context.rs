//! Call context
//!
//! A [`CallContext`] is the single cancellation and deadline token governing
//! one public operation (a fetch, a schema query, a policy run). Every RPC
//! round-trip and every pooled-connection acquisition made on behalf of that
//! operation goes through [`CallContext::run`], so once the deadline passes
//! or the token is cancelled the in-flight work returns promptly.

use std::future::Future;
use std::time::Duration;

use harvest_sdk::errors::EngineError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a guarded future did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    DeadlineExceeded { elapsed: Duration },
    Cancelled,
}

impl Interrupted {
    /// Attribute the interruption to an operation on a provider or on the
    /// store
    pub fn into_error(self, provider: &str, operation: &str) -> EngineError {
        match self {
            Self::DeadlineExceeded { elapsed } => EngineError::DeadlineExceeded {
                provider: provider.to_string(),
                operation: operation.to_string(),
                elapsed,
            },
            Self::Cancelled => EngineError::Cancelled {
                provider: provider.to_string(),
                operation: operation.to_string(),
            },
        }
    }
}

/// Deadline and cancellation token for one operation
#[derive(Debug, Clone)]
pub struct CallContext {
    started: Instant,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl CallContext {
    /// Context without a deadline that is only cancelled explicitly
    pub fn background() -> Self {
        Self {
            started: Instant::now(),
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    /// Context expiring `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: Some(started + timeout),
            token: CancellationToken::new(),
        }
    }

    /// Context expiring at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            started: Instant::now(),
            deadline: Some(deadline),
            token: CancellationToken::new(),
        }
    }

    /// Derived context sharing this deadline
    ///
    /// Cancelling the parent cancels the child, not the other way round.
    pub fn child(&self) -> Self {
        Self {
            started: self.started,
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    /// Cancel this context and all of its children
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Time since the context was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the context is no longer usable, if it is not
    pub fn interruption(&self) -> Option<Interrupted> {
        if self.is_expired() {
            Some(Interrupted::DeadlineExceeded {
                elapsed: self.elapsed(),
            })
        } else if self.is_cancelled() {
            Some(Interrupted::Cancelled)
        } else {
            None
        }
    }

    /// Drive `future` until it completes, the deadline passes or the context
    /// is cancelled, whichever happens first
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Interrupted> {
        if let Some(interrupted) = self.interruption() {
            return Err(interrupted);
        }

        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            output = future => Ok(output),
            _ = expiry => Err(Interrupted::DeadlineExceeded { elapsed: self.elapsed() }),
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_completes() {
        let ctx = CallContext::background();
        assert_eq!(ctx.run(async { 42 }).await, Ok(42));
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_deadline_interrupts() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;

        assert!(matches!(result, Err(Interrupted::DeadlineExceeded { .. })));
        assert!(ctx.is_expired());
        assert!(ctx.deadline().is_some());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = CallContext::background();
        let child = parent.child();
        parent.cancel();

        assert!(child.is_cancelled());
        assert_eq!(child.run(async {}).await, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = CallContext::background();
        let child = parent.child();
        child.cancel();

        assert!(!parent.is_cancelled());
        assert!(parent.interruption().is_none());
    }
}
