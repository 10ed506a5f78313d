//! Cancellation and deadline context for blocking operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uvmlite_shared::errors::{UvmError, UvmResult};

/// Carries a cancellation token and an optional deadline.
///
/// Derived contexts share cancellation with their parent: cancelling the
/// parent cancels every child, never the other way round. A child deadline is
/// never later than its parent's.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A child context that can be cancelled independently.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail if the context is already cancelled or past its deadline.
    pub fn check(&self, op: &str) -> UvmResult<()> {
        if self.token.is_cancelled() {
            return Err(UvmError::Cancelled(op.to_string()));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(UvmError::DeadlineExceeded(op.to_string()));
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled, or the
    /// deadline passes, whichever comes first. `fut` is dropped on
    /// cancellation.
    pub async fn run<F, T>(&self, op: &str, fut: F) -> UvmResult<T>
    where
        F: Future<Output = UvmResult<T>>,
    {
        self.check(op)?;

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(UvmError::Cancelled(op.to_string())),
            _ = expired => Err(UvmError::DeadlineExceeded(op.to_string())),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = OpContext::background();
        let value = ctx.run("op", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_run() {
        let ctx = OpContext::background();
        ctx.cancel();
        let err = ctx.run("create", async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, UvmError::Cancelled(ref op) if op == "create"));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_pending_future() {
        let ctx = OpContext::background().with_timeout(Duration::from_millis(20));
        let err = ctx
            .run("start", std::future::pending::<UvmResult<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, UvmError::DeadlineExceeded(_)));
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = OpContext::background();
        let child = parent.with_cancel();
        parent.cancel();
        assert!(child.is_cancelled());

        let other = OpContext::background();
        let other_child = other.with_cancel();
        other_child.cancel();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_child_deadline_capped_by_parent() {
        let parent = OpContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
