//! Metrics module
//!
//! Prometheus counters and histograms for API calls, retries and uploads,
//! registered in the default registry.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Encoder,
    Histogram, HistogramVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "b2_requests_total",
        "API requests by method and HTTP status",
        &["method", "status"]  // status is "transport" when no response arrived
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "b2_request_duration_seconds",
        "Time to response headers in seconds",
        &["method"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    // Retry metrics
    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "b2_retries_total",
        "Retries by recovery action",
        &["action"]
    ).unwrap();

    // Upload metrics
    pub static ref UPLOAD_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "b2_upload_bytes_total",
        "Bytes accepted by upload calls",
        &["method"]
    ).unwrap();

    pub static ref LARGE_FILES_TOTAL: CounterVec = register_counter_vec!(
        "b2_large_files_total",
        "Large files by outcome",
        &["outcome"]  // "finished" or "cancelled"
    ).unwrap();

    pub static ref LARGE_FILE_PARTS: Histogram = register_histogram!(
        "b2_large_file_parts",
        "Number of parts per finished large file",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
    ).unwrap();
}

/// Record one API call
pub fn record_request(method: &str, status: &str, duration: Duration) {
    REQUESTS_TOTAL.with_label_values(&[method, status]).inc();
    REQUEST_DURATION
        .with_label_values(&[method])
        .observe(duration.as_secs_f64());
}

/// Record a retry taken for `action`
pub fn record_retry(action: &str) {
    RETRIES_TOTAL.with_label_values(&[action]).inc();
}

/// Record bytes accepted by an upload call
pub fn record_upload_bytes(method: &str, bytes: u64) {
    UPLOAD_BYTES_TOTAL
        .with_label_values(&[method])
        .inc_by(bytes as f64);
}

/// Record a large file reaching `outcome`
pub fn record_large_file(outcome: &str) {
    LARGE_FILES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record the part count of a finished large file
pub fn record_parts(parts_count: usize) {
    LARGE_FILE_PARTS.observe(parts_count as f64);
}

/// Default registry in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
