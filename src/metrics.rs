//! Prometheus metrics for the background workers.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all booking server metrics
const PREFIX: &str = "booking_server";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref WORKER_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_worker_running"), "Whether a background worker task is running"),
        &["worker"]
    ).expect("Failed to create worker_running metric");

    pub static ref WORKER_CYCLES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_worker_cycles_total"), "Total worker cycles by outcome"),
        &["worker", "status"]
    ).expect("Failed to create worker_cycles_total metric");

    pub static ref WORKER_CYCLE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_worker_cycle_duration_seconds"),
            "Duration of a single worker cycle in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        &["worker"]
    ).expect("Failed to create worker_cycle_duration_seconds metric");

    pub static ref WORKER_RESULTS_DROPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_worker_results_dropped_total"),
            "Cycle results discarded because the result buffer was full"
        ),
        &["worker"]
    ).expect("Failed to create worker_results_dropped_total metric");

    pub static ref BOOKINGS_EXPIRED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_bookings_expired_total"),
        "Total pending bookings moved to expired"
    ).expect("Failed to create bookings_expired_total metric");
}

/// Register all metrics with the registry.
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(WORKER_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(WORKER_CYCLES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(WORKER_CYCLE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(WORKER_RESULTS_DROPPED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BOOKINGS_EXPIRED_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn set_worker_running(worker: &str, running: bool) {
    WORKER_RUNNING
        .with_label_values(&[worker])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_worker_cycle(worker: &str, status: &str, duration: Duration) {
    WORKER_CYCLES_TOTAL
        .with_label_values(&[worker, status])
        .inc();
    WORKER_CYCLE_DURATION_SECONDS
        .with_label_values(&[worker])
        .observe(duration.as_secs_f64());
}

pub fn record_worker_result_dropped(worker: &str) {
    WORKER_RESULTS_DROPPED_TOTAL
        .with_label_values(&[worker])
        .inc();
}

pub fn record_bookings_expired(count: usize) {
    BOOKINGS_EXPIRED_TOTAL.inc_by(count as f64);
}

/// Render all registered metrics in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_worker_metrics() {
        init_metrics();
        set_worker_running("metrics_test_worker", true);
        record_worker_cycle("metrics_test_worker", "success", Duration::from_millis(5));
        record_worker_result_dropped("metrics_test_worker");

        let text = gather_text();
        assert!(text.contains("booking_server_worker_running"));
        assert!(text.contains("booking_server_worker_cycles_total"));
        assert!(text.contains("metrics_test_worker"));
    }

    #[test]
    fn test_init_metrics_is_repeatable() {
        init_metrics();
        init_metrics();
    }
}
