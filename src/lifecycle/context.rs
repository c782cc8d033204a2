//! Process-wide cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why the process started shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// An OS signal was received.
    Signal(&'static str),
    /// A listener failed after startup.
    ListenerFailed { endpoint: String, error: String },
    /// `Stop` was called explicitly.
    Stopped,
    /// The parent token supplied by an embedder was cancelled.
    Parent,
}

impl ShutdownCause {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::ListenerFailed { .. } => "listener_failed",
            Self::Stopped => "stopped",
            Self::Parent => "parent",
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {name}"),
            Self::ListenerFailed { endpoint, error } => {
                write!(f, "listener {endpoint} failed: {error}")
            }
            Self::Stopped => f.write_str("stop requested"),
            Self::Parent => f.write_str("parent context cancelled"),
        }
    }
}

/// Cancellable context shared by every task the manager starts.
///
/// Cancellation is one-way. The first [`cancel`](Self::cancel) wins a
/// compare-and-swap and records its cause; later calls are no-ops.
#[derive(Clone)]
pub struct ProcessContext {
    token: CancellationToken,
    shared: Arc<Shared>,
}

struct Shared {
    fired: AtomicBool,
    cause: OnceLock<ShutdownCause>,
}

impl ProcessContext {
    /// Create a new root context.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Create a context that is also cancelled when `parent` is.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            shared: Arc::new(Shared {
                fired: AtomicBool::new(false),
                cause: OnceLock::new(),
            }),
        }
    }

    /// Cancel the context. Returns `true` only for the call that performed the cancellation.
    pub fn cancel(&self, cause: ShutdownCause) -> bool {
        // A parent token firing counts as the first cancellation.
        if self.token.is_cancelled() {
            self.shared.fired.store(true, Ordering::Release);
            tracing::debug!(%cause, "Context already cancelled by parent");
            return false;
        }
        if self
            .shared
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(%cause, "Context already cancelled");
            return false;
        }

        tracing::info!(%cause, "Shutdown triggered");
        crate::observability::metrics::record_shutdown(cause.label());
        let _ = self.shared.cause.set(cause);
        self.token.cancel();
        true
    }

    /// Whether the context has been cancelled, by us or by a parent token.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Cause recorded by the winning `cancel`, or `Parent` if a parent token fired.
    pub fn cause(&self) -> Option<ShutdownCause> {
        match self.shared.cause.get() {
            Some(cause) => Some(cause.clone()),
            None if self.token.is_cancelled() => Some(ShutdownCause::Parent),
            None => None,
        }
    }

    /// Token for work that must stop with this context but may be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.shared.cause.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_cancel_wins() {
        let ctx = ProcessContext::new();
        assert!(ctx.cancel(ShutdownCause::Signal("SIGTERM")));
        assert!(!ctx.cancel(ShutdownCause::Stopped));
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cause(), Some(ShutdownCause::Signal("SIGTERM")));
    }

    #[tokio::test]
    async fn concurrent_cancels_elect_exactly_one_winner() {
        let ctx = ProcessContext::new();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let ctx = ctx.clone();
            tasks.spawn(async move {
                ctx.cancel(ShutdownCause::ListenerFailed {
                    endpoint: format!("tcp://:{i}"),
                    error: "boom".into(),
                })
            });
        }

        let mut winners = 0;
        while let Some(won) = tasks.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = ProcessContext::child_of(&parent);
        parent.cancel();

        tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
            .await
            .unwrap();
        assert_eq!(ctx.cause(), Some(ShutdownCause::Parent));
    }

    #[test]
    fn cancel_after_parent_keeps_parent_cause() {
        let parent = CancellationToken::new();
        let ctx = ProcessContext::child_of(&parent);
        parent.cancel();

        assert!(!ctx.cancel(ShutdownCause::Stopped));
        assert!(!ctx.cancel(ShutdownCause::Signal("SIGTERM")));
        assert_eq!(ctx.cause(), Some(ShutdownCause::Parent));
    }

    #[test]
    fn child_tokens_follow_the_context() {
        let ctx = ProcessContext::new();
        let child = ctx.child_token();
        child.cancel();
        assert!(!ctx.is_cancelled());

        let other = ctx.child_token();
        ctx.cancel(ShutdownCause::Stopped);
        assert!(other.is_cancelled());
    }
}
