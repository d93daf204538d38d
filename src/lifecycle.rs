//! Cancellation scope and bounded shutdown for a running edge or agent.
//!
//! One [`Lifecycle`] per instance. Every long-lived task (accept loop, relay
//! receive loop, keepalive, per-connection handlers, dispatched requests) is
//! spawned through it so stop can cancel them together and wait a bounded
//! time for them to finish.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when stop begins.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a task that stop will wait for.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Cancel the scope without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait up to `grace` for every tracked task to finish.
    ///
    /// Returns `true` when all tasks finished in time. Stragglers are left
    /// running detached; they hold no locks the caller needs.
    pub async fn wait(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("All tasks stopped");
            true
        } else {
            warn!(
                remaining = self.tracker.len(),
                "Tasks still running after {}ms, abandoning them",
                grace.as_millis()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_tasks_finish_within_grace() {
        let lifecycle = Lifecycle::new();
        let token = lifecycle.token().clone();
        lifecycle.spawn(async move { token.cancelled().await });

        lifecycle.cancel();
        assert!(lifecycle.is_stopping());
        assert!(lifecycle.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_abandoned() {
        let lifecycle = Lifecycle::new();
        lifecycle.spawn(std::future::pending::<()>());

        lifecycle.cancel();
        assert!(!lifecycle.wait(Duration::from_millis(200)).await);
    }
}
