//! Active health checker.
//!
//! Periodically probes every backend with a TCP connect and overwrites its
//! liveness with the result.

use crate::backend::{Backend, BackendPool};
use crate::metrics::MetricsCollector;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Active health checker that probes backend servers.
pub struct HealthChecker {
    pool: Arc<BackendPool>,
    metrics: MetricsCollector,
    /// Time between sweeps.
    interval: Duration,
    /// Per-probe connect timeout.
    timeout: Duration,
}

/// Outcome of one sweep over the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepSummary {
    pub alive: usize,
    pub dead: usize,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(
        pool: Arc<BackendPool>,
        metrics: MetricsCollector,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            metrics,
            interval,
            timeout,
        }
    }

    /// Run sweeps on a fixed interval until shutdown.
    ///
    /// The first sweep happens one interval after start; backends begin alive.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval = %humantime::format_duration(self.interval),
            timeout = %humantime::format_duration(self.timeout),
            backends = self.pool.len(),
            "health checker starting"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.sweep().await;
                    info!(alive = summary.alive, dead = summary.dead, "health check completed");
                }

                _ = shutdown.recv() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every backend concurrently and apply the results.
    ///
    /// This is the only path that can mark a dead backend alive again.
    pub async fn sweep(&self) -> SweepSummary {
        let probes = self
            .pool
            .backends()
            .iter()
            .map(|backend| async move { (backend, probe(backend, self.timeout).await) });

        let mut summary = SweepSummary::default();

        for (backend, result) in join_all(probes).await {
            let name = backend.to_string();
            let was_alive = backend.is_alive();
            let alive = result.is_ok();

            backend.set_alive(alive);
            self.metrics.record_health_check(&name, alive);
            self.metrics.set_backend_alive(&name, alive);

            match result {
                Ok(()) => {
                    summary.alive += 1;
                    if was_alive {
                        debug!(backend = %name, "health check passed");
                    } else {
                        info!(backend = %name, "backend is reachable again, marked alive");
                    }
                }
                Err(e) => {
                    summary.dead += 1;
                    if was_alive {
                        warn!(backend = %name, error = %e, "health check failed, marked dead");
                    } else {
                        debug!(backend = %name, error = %e, "backend still unreachable");
                    }
                }
            }
        }

        summary
    }
}

/// Check that a TCP connection to the backend can be opened in time.
async fn probe(backend: &Backend, probe_timeout: Duration) -> Result<(), String> {
    let (host, port) = backend.probe_target();

    match timeout(probe_timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err("connection timeout".to_string()),
    }
}
