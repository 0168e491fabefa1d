//! Per-tick run reports
//!
//! A [`RunReport`] is what the scheduler gets back from one
//! [`run_rollup`](crate::RollupEngine::run_rollup) call: counts for
//! alerting and the ids of the sensors that will be retried next tick.

use serde::Serialize;

use crate::error::{ErrorKind, Result, RollupError};
use crate::period::PeriodType;
use crate::sample::SensorId;

/// Why one sensor was not committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorFailure {
    pub sensor_id: SensorId,
    pub kind: ErrorKind,
    pub message: String,
}

impl SensorFailure {
    /// Capture the failure of a sensor's unit of work
    pub fn new(sensor_id: SensorId, error: &RollupError) -> Self {
        Self {
            sensor_id,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Whether the next tick may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::StoreUnavailable | ErrorKind::Timeout)
    }
}

/// Outcome of one rollup tick for one period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub period: PeriodType,
    /// Sensors whose buckets and cursor were committed
    pub processed: usize,
    /// Buckets upserted by committed sensors
    pub buckets_written: usize,
    /// Due sensors whose next window is not closed yet
    pub idle: Vec<SensorId>,
    /// Sensors skipped because another tick is rolling them up
    pub busy: Vec<SensorId>,
    /// Sensors not started before shutdown
    pub cancelled: Vec<SensorId>,
    /// Sensors that failed; their cursor is unchanged
    pub failed: Vec<SensorFailure>,
}

impl RunReport {
    /// Empty report for `period`
    pub fn new(period: PeriodType) -> Self {
        Self {
            period,
            processed: 0,
            buckets_written: 0,
            idle: Vec::new(),
            busy: Vec::new(),
            cancelled: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Ids of the failed sensors, ascending
    pub fn failed_ids(&self) -> Vec<SensorId> {
        let mut ids: Vec<_> = self.failed.iter().map(|f| f.sensor_id).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of sensors the tick looked at
    pub fn selected(&self) -> usize {
        self.processed + self.idle.len() + self.busy.len() + self.cancelled.len() + self.failed.len()
    }

    /// Whether every selected sensor was committed or had nothing to do
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty() && self.busy.is_empty()
    }

    /// Convert failures into [`RollupError::PartialBatchFailure`]
    pub fn into_result(self) -> Result<RunReport> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        Err(RollupError::PartialBatchFailure {
            period: self.period,
            processed: self.processed,
            failed: self.failed_ids(),
        })
    }

    /// Sort id lists so reports compare deterministically
    pub(crate) fn normalize(&mut self) {
        self.idle.sort_unstable();
        self.busy.sort_unstable();
        self.cancelled.sort_unstable();
        self.failed.sort_by_key(|f| f.sensor_id);
    }
}
