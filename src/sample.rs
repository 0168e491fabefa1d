//! Sample, bucket and sensor record types

use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::period::{PeriodType, ROLLUP_PERIODS};

/// Unique identifier for a sensor
pub type SensorId = u64;

/// Identifier of the container (enclosure) a sensor belongs to
pub type ContainerId = u64;

/// Unix time in seconds
pub type Timestamp = i64;

/// One point of a series: a raw measurement or a stored bucket average
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Measurement time, or bucket boundary for aggregates
    pub measuring_at: Timestamp,
    /// Measured or averaged value
    pub value: BigDecimal,
}

impl SeriesPoint {
    /// Create a new point
    pub fn new(measuring_at: Timestamp, value: BigDecimal) -> Self {
        Self {
            measuring_at,
            value,
        }
    }
}

/// A point tagged with its sensor and granularity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSample {
    pub sensor_id: SensorId,
    pub measuring_at: Timestamp,
    pub value: BigDecimal,
    pub period: PeriodType,
}

impl SensorSample {
    /// Raw per-minute sample
    pub fn raw(sensor_id: SensorId, measuring_at: Timestamp, value: BigDecimal) -> Self {
        Self {
            sensor_id,
            measuring_at,
            value,
            period: PeriodType::Minute,
        }
    }

    /// Drop the sensor and granularity tags
    pub fn into_point(self) -> SeriesPoint {
        SeriesPoint::new(self.measuring_at, self.value)
    }
}

/// Averaged value of one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketValue {
    pub sensor_id: SensorId,
    /// Closing boundary of the bucket
    pub bucket_start: Timestamp,
    pub value: BigDecimal,
    /// Number of samples averaged into `value`
    pub samples: usize,
}

/// Rollup progress of one sensor
///
/// `last_update_at` is advanced by raw ingest; the period cursors are only
/// ever advanced by the rollup engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorCursor {
    pub sensor_id: SensorId,
    pub container_id: ContainerId,
    /// Time of the most recent raw sample
    pub last_update_at: Option<Timestamp>,
    /// Last boundary rolled up, per period
    pub periods: BTreeMap<PeriodType, Timestamp>,
}

impl SensorCursor {
    /// Cursor of a sensor that has never been written to
    pub fn new(sensor_id: SensorId, container_id: ContainerId) -> Self {
        Self {
            sensor_id,
            container_id,
            last_update_at: None,
            periods: BTreeMap::new(),
        }
    }

    /// Last boundary rolled up for `period`
    pub fn period_cursor(&self, period: PeriodType) -> Option<Timestamp> {
        self.periods.get(&period).copied()
    }

    /// Boundary up to which every rollup period is complete
    ///
    /// `None` while any rollup period has never run for this sensor.
    pub fn last_update_periods_at(&self) -> Option<Timestamp> {
        ROLLUP_PERIODS
            .iter()
            .map(|p| self.period_cursor(*p))
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }

    /// Whether raw data exists past `boundary`
    pub fn has_data_after(&self, boundary: Timestamp) -> bool {
        self.last_update_at.map_or(false, |t| t > boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_update_periods_at_requires_all_periods() {
        let mut cursor = SensorCursor::new(1, 10);
        assert_eq!(cursor.last_update_periods_at(), None);

        for (i, period) in ROLLUP_PERIODS.iter().enumerate() {
            cursor.periods.insert(*period, 86_400 + i as i64 * 3600);
        }
        assert_eq!(cursor.last_update_periods_at(), Some(86_400));

        cursor.periods.remove(&PeriodType::Day);
        assert_eq!(cursor.last_update_periods_at(), None);
    }

    #[test]
    fn test_has_data_after() {
        let mut cursor = SensorCursor::new(1, 10);
        assert!(!cursor.has_data_after(0));
        cursor.last_update_at = Some(1000);
        assert!(cursor.has_data_after(999));
        assert!(!cursor.has_data_after(1000));
    }

    #[test]
    fn test_raw_sample() {
        let sample = SensorSample::raw(3, 60, BigDecimal::from(21));
        assert_eq!(sample.period, PeriodType::Minute);
        assert_eq!(sample.into_point(), SeriesPoint::new(60, BigDecimal::from(21)));
    }
}
