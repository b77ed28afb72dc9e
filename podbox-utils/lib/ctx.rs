//! Cancellable, deadline-bearing operation contexts.
//!
//! Every public orchestrator operation accepts an [`OpCtx`]. The context carries an
//! optional absolute deadline and a cancellation token; cluster calls and poll loops
//! observe both and return promptly when either fires. A context without a deadline is
//! bounded by the configured per-call default at the cluster client boundary.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Operation handle threaded through every cluster-touching call.
#[derive(Debug, Clone, Default)]
pub struct OpCtx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OpCtx {
    /// Creates a context with no deadline and a fresh cancellation token.
    pub fn background() -> Self {
        Self::default()
    }

    /// Creates a context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Creates a context with an explicit absolute deadline.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Creates a context driven by an externally owned cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Returns the cancellation token backing this context.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation of this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The absolute deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `None` means unbounded; a zero duration means the
    /// deadline has already passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Derives a child context: cancellation propagates from this context, the deadline is
    /// inherited unchanged.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child context whose deadline is the sooner of the inherited deadline and
    /// `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_ctx_is_unbounded() {
        let ctx = OpCtx::background();
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
        assert!(!ctx.expired());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_timeout_ctx_expires() {
        let ctx = OpCtx::with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctx.expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));

        let past = Instant::now() - Duration::from_secs(1);
        assert!(OpCtx::with_deadline(past).expired());
    }

    #[test]
    fn test_child_inherits_sooner_deadline() {
        let parent = OpCtx::with_timeout(Duration::from_secs(1));
        let child = parent.child_with_timeout(Duration::from_secs(3600));
        // The parent's one-second deadline is sooner and must win.
        assert!(child.remaining().unwrap() <= Duration::from_secs(1));

        let tight = parent.child_with_timeout(Duration::from_millis(1));
        assert!(tight.remaining().unwrap() <= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_cancellation_propagates_to_children() {
        let parent = OpCtx::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        // Resolves immediately once cancelled.
        child.cancelled().await;
    }

    #[tokio::test]
    async fn test_external_token_drives_the_ctx() {
        let token = CancellationToken::new();
        let ctx = OpCtx::with_cancel(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancellation_does_not_reach_parent() {
        let parent = OpCtx::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
