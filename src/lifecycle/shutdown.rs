//! Shutdown coordination for the proxy.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::net::connection::ConnectionTracker;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for in-flight connections to finish, up to `grace`.
///
/// Returns false if connections were still open at the deadline. Long-lived
/// tunnels are the usual reason.
pub async fn drain(tracker: &ConnectionTracker, grace: Duration) -> bool {
    let open = tracker.active_count();
    if open == 0 {
        return true;
    }
    tracing::info!(open, grace = ?grace, "Draining connections");
    match tokio::time::timeout(grace, tracker.wait_for_drain()).await {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!(open = tracker.active_count(), "Drain deadline reached; exiting anyway");
            false
        }
    }
}
