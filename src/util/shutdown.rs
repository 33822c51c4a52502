//! Graceful shutdown handling.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Broadcasts a one-shot shutdown notification to every long-running task.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal manager.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown.
    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for `drain` to finish, giving up after `grace`.
///
/// Returns `true` when everything drained in time.
pub async fn drain_with_grace<F: Future<Output = ()>>(drain: F, grace: Duration) -> bool {
    match tokio::time::timeout(grace, drain).await {
        Ok(()) => true,
        Err(_) => {
            warn!(
                grace = %humantime::format_duration(grace),
                "grace period elapsed with work still in flight"
            );
            false
        }
    }
}
