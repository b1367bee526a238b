use crate::error::{AppError, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency engine.
///
/// Recording is a no-op until a recorder is installed, so the engine can run
/// without [`init_metrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    /// `outcome` is one of `exempt`, `new`, `duplicate`, `manual_duplicate`, `rejected`, `failed`.
    pub fn record_request(&self, outcome: &str) {
        counter!("idempotency_requests_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_lock_acquire(&self, backend: &str, granularity: &str, acquired: bool, duration_ms: f64) {
        counter!(
            "idempotency_lock_acquisitions_total",
            "backend" => backend.to_string(),
            "granularity" => granularity.to_string(),
            "acquired" => acquired.to_string()
        )
        .increment(1);
        histogram!("idempotency_lock_acquire_duration_ms", "backend" => backend.to_string()).record(duration_ms);
    }

    pub fn record_store_operation(&self, backend: &str, operation: &str, duration_ms: f64, success: bool) {
        counter!(
            "idempotency_store_operations_total",
            "backend" => backend.to_string(),
            "operation" => operation.to_string(),
            "success" => success.to_string()
        )
        .increment(1);
        histogram!(
            "idempotency_store_operation_duration_ms",
            "backend" => backend.to_string(),
            "operation" => operation.to_string()
        )
        .record(duration_ms);
    }

    /// A handler ran but its key could not be recorded.
    pub fn record_durability_gap(&self, backend: &str) {
        counter!("idempotency_durability_gaps_total", "backend" => backend.to_string()).increment(1);
    }

    pub fn record_cleanup(&self, removed: u64) {
        counter!("idempotency_records_expired_total").increment(removed);
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
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        AppError::Configuration(format!("Failed to install Prometheus recorder: {}", e))
    })?;
    describe_metrics();

    let handle = METRICS_HANDLE.get_or_init(|| handle).clone();
    METRICS.get_or_init(Metrics::new);

    Ok(handle)
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Requests seen by the coordinator, by outcome");
    describe_counter!("idempotency_lock_acquisitions_total", Unit::Count, "Lease acquisition attempts");
    describe_histogram!("idempotency_lock_acquire_duration_ms", Unit::Milliseconds, "Lease acquisition latency in milliseconds");
    describe_counter!("idempotency_store_operations_total", Unit::Count, "Record store operations");
    describe_histogram!("idempotency_store_operation_duration_ms", Unit::Milliseconds, "Record store latency in milliseconds");
    describe_counter!("idempotency_durability_gaps_total", Unit::Count, "Handled requests whose key could not be recorded");
    describe_counter!("idempotency_records_expired_total", Unit::Count, "Expired records removed by the cleanup job");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
