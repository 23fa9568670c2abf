//! Shutdown signal shared by the listener and every session.
//!
//! Sessions are spawned through [`ShutdownCoordinator::track`] so a drain can
//! wait for them to unregister before the hub is stopped.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TrackedFuture;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Cancellation token plus the set of sessions a drain waits on.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wrap a future so shutdown waits for it.
    pub fn track<F: Future>(&self, future: F) -> TrackedFuture<F> {
        self.tracker.track_future(future)
    }

    /// Number of tracked futures still running.
    pub fn tracked(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel the token, then wait up to `timeout` for every tracked
    /// session to return.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> Drain {
        self.shutdown();
        let _ = self.tracker.close();
        let sessions = self.tracker.len();
        info!(sessions, ?timeout, "draining sessions");

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => Drain::Complete { sessions },
            Err(_) => {
                let remaining = self.tracker.len();
                warn!(remaining, ?timeout, "sessions still running after drain timeout");
                Drain::TimedOut { remaining }
            }
        }
    }
}

/// Result of [`ShutdownCoordinator::graceful_shutdown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Drain {
    /// Every tracked session finished; `sessions` were live when draining began.
    Complete { sessions: usize },
    /// The timeout elapsed with `remaining` sessions still running.
    TimedOut { remaining: usize },
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
