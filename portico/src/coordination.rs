//! Task coordination for one server lifecycle
//!
//! Every background loop the server owns (accept loops, reapers, the
//! heartbeat manager) is spawned through a `Graceful` so `stop()` can cancel
//! and drain them deterministically. Per-connection tasks are deliberately
//! NOT tracked here: `stop()` halts accepts but lets in-flight connection
//! handlers run to completion.

/// Cancellation token + task tracker for one start/stop cycle
///
/// A fresh instance is created on every `start()`; listeners derive child
/// tokens from it so a single listener can also be stopped on its own.
#[derive(Debug, Clone)]
pub(crate) struct Graceful {
    tracker: tokio_util::task::TaskTracker,
    token: tokio_util::sync::CancellationToken,
}

impl Graceful {
    pub(crate) fn new() -> Self {
        Self {
            tracker: tokio_util::task::TaskTracker::new(),
            token: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Spawn a tracked background loop
    pub(crate) fn spawn<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Child token for a single listener
    pub(crate) fn child_token(&self) -> tokio_util::sync::CancellationToken {
        self.token.child_token()
    }

    /// Resolves when `shutdown` has been requested
    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancel every tracked loop and wait for them to exit
    pub(crate) async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_drains_tracked_tasks() {
        let graceful = Graceful::new();
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let seen = flag.clone();
        let inner = graceful.clone();
        graceful.spawn(async move {
            inner.cancelled().await;
            seen.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        graceful.shutdown().await;
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_child_token_cancels_with_parent() {
        let graceful = Graceful::new();
        let child = graceful.child_token();
        graceful.shutdown().await;
        assert!(child.is_cancelled());
    }
}
