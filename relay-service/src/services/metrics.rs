//! Metrics collection and Prometheus export.
//!
//! Installs the Prometheus recorder, serves the /metrics payload, and records
//! the relay-specific counters and histograms.

use crate::error::RelayError;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics recorder.
///
/// Call once at startup before any metrics are recorded. Later calls are
/// no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

/// Get the current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

fn outcome<T>(result: &Result<T, RelayError>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}

pub fn record_upload<T>(result: &Result<T, RelayError>, elapsed: Duration) {
    let outcome = outcome(result);
    metrics::counter!("relay_uploads_total", "outcome" => outcome).increment(1);
    metrics::histogram!("relay_upload_duration_seconds", "outcome" => outcome)
        .record(elapsed.as_secs_f64());
}

pub fn record_inference<T>(result: &Result<T, RelayError>, elapsed: Duration) {
    let outcome = outcome(result);
    metrics::counter!("relay_inference_total", "outcome" => outcome).increment(1);
    metrics::histogram!("relay_inference_duration_seconds", "outcome" => outcome)
        .record(elapsed.as_secs_f64());
}
