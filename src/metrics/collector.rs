//! Metrics collector using prometheus-client.
//!
//! Tracks request outcomes, upstream retries and failovers, and backend liveness.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: String,
}

/// Labels for per-backend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub backend: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Requests answered, by method and status.
    requests_total: Family<RequestLabels, Counter>,
    /// End-to-end request duration (in seconds), retries included.
    request_duration_seconds: Histogram,
    /// Same-backend retries.
    upstream_retries_total: Family<BackendLabels, Counter>,
    /// Backends abandoned after exhausting their retry budget.
    failovers_total: Family<BackendLabels, Counter>,
    /// Backend liveness (1 = alive, 0 = dead).
    backend_alive: Family<BackendLabels, Gauge>,
    /// Active probe results.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        // Buckets: 1ms .. ~60s
        let request_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.5, 13));
        let upstream_retries_total = Family::<BackendLabels, Counter>::default();
        let failovers_total = Family::<BackendLabels, Counter>::default();
        let backend_alive = Family::<BackendLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();

        registry.register(
            "simplelb_requests",
            "Total number of client requests answered",
            requests_total.clone(),
        );
        registry.register(
            "simplelb_request_duration_seconds",
            "Client request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "simplelb_upstream_retries",
            "Total number of same-backend retries",
            upstream_retries_total.clone(),
        );
        registry.register(
            "simplelb_failovers",
            "Total number of failovers away from a backend",
            failovers_total.clone(),
        );
        registry.register(
            "simplelb_backend_alive",
            "Backend liveness (1=alive, 0=dead)",
            backend_alive.clone(),
        );
        registry.register(
            "simplelb_health_checks",
            "Total number of active health probes",
            health_checks_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                upstream_retries_total,
                failovers_total,
                backend_alive,
                health_checks_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a request answered to a client.
    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();
        self.inner
            .request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_retry(&self, backend: &str) {
        self.inner
            .upstream_retries_total
            .get_or_create(&backend_labels(backend))
            .inc();
    }

    pub fn record_failover(&self, backend: &str) {
        self.inner
            .failovers_total
            .get_or_create(&backend_labels(backend))
            .inc();
    }

    /// Update backend liveness.
    pub fn set_backend_alive(&self, backend: &str, alive: bool) {
        self.inner
            .backend_alive
            .get_or_create(&backend_labels(backend))
            .set(if alive { 1 } else { 0 });
    }

    /// Record an active probe result.
    pub fn record_health_check(&self, backend: &str, success: bool) {
        let labels = HealthCheckLabels {
            backend: backend.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_labels(backend: &str) -> BackendLabels {
    BackendLabels {
        backend: backend.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn encoded(collector: &MetricsCollector) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, collector.registry()).unwrap();
        buffer
    }

    #[test]
    fn test_record_request() {
        let collector = MetricsCollector::new();
        collector.record_request("GET", 200, Duration::from_millis(50));
        collector.record_request("GET", 503, Duration::from_millis(5));

        let output = encoded(&collector);
        assert!(output.contains(r#"simplelb_requests_total{method="GET",status="200"} 1"#));
        assert!(output.contains(r#"simplelb_requests_total{method="GET",status="503"} 1"#));
        assert!(output.contains("simplelb_request_duration_seconds_count 2"));
    }

    #[test]
    fn test_retry_and_failover_counters() {
        let collector = MetricsCollector::new();
        collector.record_retry("http://a");
        collector.record_retry("http://a");
        collector.record_failover("http://a");

        let output = encoded(&collector);
        assert!(output.contains(r#"simplelb_upstream_retries_total{backend="http://a"} 2"#));
        assert!(output.contains(r#"simplelb_failovers_total{backend="http://a"} 1"#));
    }

    #[test]
    fn test_backend_alive_gauge() {
        let collector = MetricsCollector::new();
        collector.set_backend_alive("http://a", true);
        collector.set_backend_alive("http://a", false);

        let output = encoded(&collector);
        assert!(output.contains(r#"simplelb_backend_alive{backend="http://a"} 0"#));
    }

    #[test]
    fn test_health_check_recording() {
        let collector = MetricsCollector::new();
        collector.record_health_check("http://a", true);
        collector.record_health_check("http://a", false);

        let output = encoded(&collector);
        assert!(output.contains(
            r#"simplelb_health_checks_total{backend="http://a",result="Success"} 1"#
        ));
        assert!(output.contains(
            r#"simplelb_health_checks_total{backend="http://a",result="Failure"} 1"#
        ));
    }
}
