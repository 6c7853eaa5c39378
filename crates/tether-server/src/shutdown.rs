//! Shutdown coordination for transport-owned tasks.
//!
//! Every long-lived task a transport spawns (listener, per-channel reader and
//! writer, bridge forwarders) goes through [`ShutdownCoordinator::spawn`] so
//! that stop can cancel them together and abort whatever outlives the
//! deadline.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tracks spawned tasks and the token that asks them to stop.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
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

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Tasks spawned and not yet finished.
    pub fn task_count(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancel the token, wait up to `timeout` for tracked tasks, then abort
    /// the rest.
    ///
    /// Returns `true` when every task finished on its own.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown();
        let handles = std::mem::take(&mut *self.handles.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_ok() {
            return true;
        }

        warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
        for abort in aborts {
            abort.abort();
        }
        false
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
