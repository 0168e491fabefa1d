//! Metrics collection for rollup runs
//!
//! Cumulative counters over every tick an engine has executed, per period.

use std::collections::BTreeMap;

use crate::period::PeriodType;
use crate::report::RunReport;

/// Counters for one period
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodMetrics {
    /// Ticks that produced a report
    pub runs: u64,
    /// Ticks that failed as a whole
    pub fatal_runs: u64,
    /// Sensors committed
    pub sensors_processed: u64,
    /// Sensors that failed
    pub sensor_failures: u64,
    /// Buckets upserted
    pub buckets_written: u64,
    /// Due sensors with no closed window
    pub idle: u64,
    /// Sensors skipped by shutdown or because another tick held them
    pub skipped: u64,
}

/// Rollup statistics collector
#[derive(Debug, Clone, Default)]
pub struct RollupMetrics {
    periods: BTreeMap<PeriodType, PeriodMetrics>,
}

impl RollupMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed tick
    pub fn record_run(&mut self, report: &RunReport) {
        let entry = self.periods.entry(report.period).or_default();
        entry.runs += 1;
        entry.sensors_processed += report.processed as u64;
        entry.sensor_failures += report.failed.len() as u64;
        entry.buckets_written += report.buckets_written as u64;
        entry.idle += report.idle.len() as u64;
        entry.skipped += (report.busy.len() + report.cancelled.len()) as u64;
    }

    /// Record a tick that returned an error instead of a report
    pub fn record_fatal(&mut self, period: PeriodType) {
        self.periods.entry(period).or_default().fatal_runs += 1;
    }

    /// Counters of one period
    pub fn period(&self, period: PeriodType) -> PeriodMetrics {
        self.periods.get(&period).cloned().unwrap_or_default()
    }

    /// Total buckets written across periods
    pub fn total_buckets_written(&self) -> u64 {
        self.periods.values().map(|m| m.buckets_written).sum()
    }

    /// Fraction of sensor units that failed (0.0 - 1.0)
    pub fn failure_rate(&self) -> f64 {
        let failures: u64 = self.periods.values().map(|m| m.sensor_failures).sum();
        let processed: u64 = self.periods.values().map(|m| m.sensors_processed).sum();
        let total = failures + processed;
        if total == 0 {
            return 0.0;
        }
        failures as f64 / total as f64
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Rollup Metrics ===\n\n");
        report.push_str(&format!(
            "Buckets written: {}\n",
            self.total_buckets_written()
        ));
        report.push_str(&format!(
            "Failure rate: {:.1}%\n\n",
            self.failure_rate() * 100.0
        ));

        report.push_str("Per period:\n");
        for (period, m) in &self.periods {
            report.push_str(&format!(
                "  {:>4} min: {} runs ({} fatal), {} sensors, {} buckets, {} failed, {} idle, {} skipped\n",
                period.minutes(),
                m.runs,
                m.fatal_runs,
                m.sensors_processed,
                m.buckets_written,
                m.sensor_failures,
                m.idle,
                m.skipped
            ));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RollupError;
    use crate::report::SensorFailure;

    #[test]
    fn test_metrics_record_run() {
        let mut metrics = RollupMetrics::new();
        let mut report = RunReport::new(PeriodType::Hour);
        report.processed = 3;
        report.buckets_written = 7;
        report.idle = vec![4];
        report.cancelled = vec![5, 6];
        report
            .failed
            .push(SensorFailure::new(1, &RollupError::StoreUnavailable("x".into())));

        metrics.record_run(&report);
        metrics.record_run(&report);
        metrics.record_fatal(PeriodType::Hour);

        let hour = metrics.period(PeriodType::Hour);
        assert_eq!(hour.runs, 2);
        assert_eq!(hour.fatal_runs, 1);
        assert_eq!(hour.sensors_processed, 6);
        assert_eq!(hour.buckets_written, 14);
        assert_eq!(hour.idle, 2);
        assert_eq!(hour.skipped, 4);
        assert_eq!(metrics.period(PeriodType::Day), PeriodMetrics::default());
        assert!((metrics.failure_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_report() {
        let mut metrics = RollupMetrics::new();
        let mut report = RunReport::new(PeriodType::Day);
        report.buckets_written = 2;
        metrics.record_run(&report);

        let text = metrics.report();
        assert!(text.contains("Buckets written: 2"));
        assert!(text.contains("1440 min"));

        metrics.reset();
        assert_eq!(metrics.total_buckets_written(), 0);
    }
}
