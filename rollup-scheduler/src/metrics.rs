// sensor-rollup scheduler - Prometheus metrics definitions
//
// Licensed under AGPL-3.0. See LICENSE file for details.

//! Prometheus metrics for rollup monitoring.
//!
//! Every tick updates these from its [`RunReport`], labelled by period in
//! minutes.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge, GaugeVec,
    TextEncoder,
};
use sensor_rollup::{ErrorKind, PeriodType, RunReport};
use tracing::warn;

lazy_static! {
    /// Ticks executed, by outcome (complete, partial, failed).
    pub static ref ROLLUP_RUNS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_runs_total",
        "Rollup ticks executed",
        &["period", "outcome"]
    ).unwrap();

    /// Buckets upserted.
    pub static ref BUCKETS_WRITTEN_TOTAL: CounterVec = register_counter_vec!(
        "rollup_buckets_written_total",
        "Aggregated buckets written",
        &["period"]
    ).unwrap();

    /// Sensors committed.
    pub static ref SENSORS_PROCESSED_TOTAL: CounterVec = register_counter_vec!(
        "rollup_sensors_processed_total",
        "Sensors whose buckets and cursor were committed",
        &["period"]
    ).unwrap();

    /// Sensor failures by error kind.
    pub static ref SENSOR_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_sensor_failures_total",
        "Sensors left for the next tick after an error",
        &["period", "kind"]
    ).unwrap();

    /// Due sensors whose next window was still open on the last tick.
    pub static ref SENSORS_IDLE: GaugeVec = register_gauge_vec!(
        "rollup_sensors_idle",
        "Due sensors with no closed window on the last tick",
        &["period"]
    ).unwrap();

    /// Wall time of the last tick.
    pub static ref LAST_RUN_SECONDS: GaugeVec = register_gauge_vec!(
        "rollup_last_run_seconds",
        "Duration of the last rollup tick in seconds",
        &["period"]
    ).unwrap();

    /// Raw samples loaded at startup.
    pub static ref RAW_SAMPLES_LOADED: Gauge = register_gauge!(
        "rollup_raw_samples_loaded",
        "Raw samples loaded from the dataset"
    ).unwrap();
}

/// Record a tick that returned a report.
pub fn record_report(report: &RunReport, elapsed: Duration) {
    let period = report.period.to_string();
    let outcome = if report.failed.is_empty() {
        "complete"
    } else {
        "partial"
    };

    ROLLUP_RUNS_TOTAL
        .with_label_values(&[&period, outcome])
        .inc();
    BUCKETS_WRITTEN_TOTAL
        .with_label_values(&[&period])
        .inc_by(report.buckets_written as f64);
    SENSORS_PROCESSED_TOTAL
        .with_label_values(&[&period])
        .inc_by(report.processed as f64);
    for failure in &report.failed {
        SENSOR_FAILURES_TOTAL
            .with_label_values(&[&period, failure.kind.as_str()])
            .inc();
    }
    SENSORS_IDLE
        .with_label_values(&[&period])
        .set(report.idle.len() as f64);
    LAST_RUN_SECONDS
        .with_label_values(&[&period])
        .set(elapsed.as_secs_f64());
}

/// Record a tick that failed as a whole.
pub fn record_fatal(period: PeriodType, kind: ErrorKind, elapsed: Duration) {
    let period = period.to_string();
    ROLLUP_RUNS_TOTAL
        .with_label_values(&[&period, "failed"])
        .inc();
    SENSOR_FAILURES_TOTAL
        .with_label_values(&[&period, kind.as_str()])
        .inc();
    LAST_RUN_SECONDS
        .with_label_values(&[&period])
        .set(elapsed.as_secs_f64());
}

/// Set the number of samples loaded at startup.
pub fn set_samples_loaded(count: usize) {
    RAW_SAMPLES_LOADED.set(count as f64);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
