//! Metrics for overflow bridges
//!
//! Prometheus counters and gauges, labelled by topic, describing how
//! records move through each bridge and what the spill files cost.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, Counter, CounterVec, Encoder,
    GaugeVec, TextEncoder,
};

/// Record went straight to the target queue
pub const PATH_DIRECT: &str = "direct";
/// Record was written to disk
pub const PATH_SPILLED: &str = "spilled";
/// Record was read back from disk and delivered
pub const PATH_UNSPILLED: &str = "unspilled";
/// Record was lost to an I/O or codec failure
pub const PATH_DROPPED: &str = "dropped";
/// Record was still undelivered at shutdown
pub const PATH_DISCARDED: &str = "discarded";

lazy_static! {
    // === Record flow ===

    /// Records by the path they took through the bridge
    pub static ref RECORDS_TOTAL: CounterVec = register_counter_vec!(
        "spill_records_total",
        "Records handled by overflow bridges, by path",
        &["topic", "path"]
    ).unwrap();

    /// Records accepted from producers
    pub static ref PUTS_TOTAL: CounterVec = register_counter_vec!(
        "spill_puts_total",
        "Records accepted from producers",
        &["topic"]
    ).unwrap();

    /// Records handed to consumers
    pub static ref READS_TOTAL: CounterVec = register_counter_vec!(
        "spill_reads_total",
        "Records handed to consumers",
        &["topic"]
    ).unwrap();

    // === Resource gauges ===

    /// Records currently waiting on disk
    pub static ref PENDING_SPILLED: GaugeVec = register_gauge_vec!(
        "spill_pending_records",
        "Records currently waiting in spill files",
        &["topic"]
    ).unwrap();

    /// Worker liveness (0=stopped, 1=running)
    pub static ref WORKER_ALIVE: GaugeVec = register_gauge_vec!(
        "spill_worker_alive",
        "Spill worker liveness (0=stopped, 1=running)",
        &["topic"]
    ).unwrap();

    /// Spill files created
    pub static ref FILES_CREATED: Counter = register_counter!(
        "spill_files_created_total",
        "Spill files created"
    ).unwrap();

    // === Error counters ===

    /// Errors by kind and operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "spill_errors_total",
        "Spill errors by kind and operation",
        &["topic", "error_type", "operation"]
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record `count` records taking `path`
#[inline]
pub fn record_path(topic: &str, path: &str, count: u64) {
    if count > 0 {
        RECORDS_TOTAL
            .with_label_values(&[topic, path])
            .inc_by(count as f64);
    }
}

/// Record an accepted put
#[inline]
pub fn record_put(topic: &str) {
    PUTS_TOTAL.with_label_values(&[topic]).inc();
}

/// Record a consumer read
#[inline]
pub fn record_read(topic: &str) {
    READS_TOTAL.with_label_values(&[topic]).inc();
}

/// Record an error
#[inline]
pub fn record_error(topic: &str, error_type: &str, operation: &str) {
    ERRORS_TOTAL
        .with_label_values(&[topic, error_type, operation])
        .inc();
}

/// Record a new spill file
#[inline]
pub fn record_file_created() {
    FILES_CREATED.inc();
}

/// Update the pending spilled records gauge
#[inline]
pub fn update_pending(topic: &str, pending: usize) {
    PENDING_SPILLED
        .with_label_values(&[topic])
        .set(pending as f64);
}

/// Update the worker liveness gauge
#[inline]
pub fn update_worker_alive(topic: &str, alive: bool) {
    WORKER_ALIVE
        .with_label_values(&[topic])
        .set(if alive { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_path() {
        record_path("metrics_test", PATH_SPILLED, 3);
        assert_eq!(
            RECORDS_TOTAL
                .with_label_values(&["metrics_test", PATH_SPILLED])
                .get(),
            3.0
        );

        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("spill_records_total"));
    }

    #[test]
    fn test_gauges() {
        update_pending("metrics_gauge", 12);
        update_worker_alive("metrics_gauge", true);
        assert_eq!(PENDING_SPILLED.with_label_values(&["metrics_gauge"]).get(), 12.0);
        assert_eq!(WORKER_ALIVE.with_label_values(&["metrics_gauge"]).get(), 1.0);
    }

    #[test]
    fn test_record_error() {
        record_error("metrics_err", "io", "spill");
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("spill_errors_total"));
    }
}
