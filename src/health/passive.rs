//! Passive health tracking.
//!
//! Marks a backend dead when real traffic to it keeps failing.

use crate::backend::Backend;
use crate::metrics::MetricsCollector;
use tracing::warn;

/// Applies the passive liveness downgrade.
///
/// Called by the request forwarder once a backend has used up its retry
/// budget. The downgrade is unconditional; only the active checker can bring
/// the backend back.
#[derive(Clone)]
pub struct PassiveHealthTracker {
    metrics: MetricsCollector,
}

impl PassiveHealthTracker {
    /// Create a new passive health tracker.
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }

    /// Mark a backend dead after repeated forwarding failures.
    pub fn mark_dead(&self, backend: &Backend) {
        let was_alive = backend.is_alive();
        backend.set_alive(false);

        let name = backend.to_string();
        self.metrics.set_backend_alive(&name, false);

        if was_alive {
            warn!(backend = %name, "backend marked dead after forwarding failures");
        }
    }
}
