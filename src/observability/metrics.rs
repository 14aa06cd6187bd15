use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the request-safety layer.
///
/// Recording is a no-op until [`init_metrics`] installs a recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_idempotency_outcome(&self, operation: &str, outcome: &'static str) {
        counter!("gateway_idempotency_requests_total", "operation" => operation.to_string(), "outcome" => outcome).increment(1);
    }

    pub fn record_idempotency_conflict(&self, operation: &str) {
        counter!("gateway_idempotency_conflicts_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_response_captured(&self, operation: &str, status: u16) {
        counter!("gateway_idempotency_responses_captured_total", "operation" => operation.to_string(), "status" => status.to_string()).increment(1);
    }

    pub fn record_expired_purged(&self, count: u64) {
        counter!("gateway_idempotency_expired_purged_total").increment(count);
    }

    pub fn record_url_check(&self, outcome: &'static str) {
        counter!("gateway_ssrf_checks_total", "outcome" => outcome).increment(1);
    }

    pub fn record_dns_latency(&self, duration_ms: f64, success: bool) {
        histogram!("gateway_ssrf_dns_duration_ms", "success" => success.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
///
/// Concurrent first calls block on the same initializer, so only one of them
/// installs the recorder and all of them see its outcome.
pub fn init_metrics() -> Result<PrometheusHandle, String> {
    METRICS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;
            describe_metrics();
            METRICS.get_or_init(Metrics::new);
            Ok(handle)
        })
        .clone()
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("gateway_idempotency_requests_total", Unit::Count, "Idempotent write requests by outcome");
    describe_counter!("gateway_idempotency_conflicts_total", Unit::Count, "Idempotency keys reused with a different body");
    describe_counter!("gateway_idempotency_responses_captured_total", Unit::Count, "Responses captured for replay");
    describe_counter!("gateway_idempotency_expired_purged_total", Unit::Count, "Expired idempotency records removed by the sweep");

    describe_counter!("gateway_ssrf_checks_total", Unit::Count, "Outbound URL safety checks by outcome");
    describe_histogram!("gateway_ssrf_dns_duration_ms", Unit::Milliseconds, "Outbound host resolution latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
