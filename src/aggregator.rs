//! Bucket aggregation
//!
//! The [`BucketAggregator`] groups samples by the bucket they fall into and
//! averages each group. Sums are kept as exact decimals and divided once per
//! bucket, so the result does not depend on the order samples arrive in.

use std::collections::BTreeMap;

use bigdecimal::{BigDecimal, RoundingMode, Zero};

use crate::error::Result;
use crate::period::bucket_start;
use crate::sample::{BucketValue, SensorId, SeriesPoint, Timestamp};

/// Fractional digits kept on stored averages (`decimal(18,14)` columns)
pub const DEFAULT_VALUE_SCALE: i64 = 14;

/// Running sum of one bucket
#[derive(Debug, Clone)]
pub struct BucketAccumulator {
    sum: BigDecimal,
    count: usize,
}

impl BucketAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self {
            sum: BigDecimal::zero(),
            count: 0,
        }
    }

    /// Add one sample
    pub fn add(&mut self, value: &BigDecimal) {
        self.sum += value;
        self.count += 1;
    }

    /// Number of samples added
    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean rounded half-even to `scale` fractional digits, `None` when empty
    pub fn mean(&self, scale: i64) -> Option<BigDecimal> {
        if self.count == 0 {
            return None;
        }
        let mean = self.sum.clone() / BigDecimal::from(self.count as u64);
        Some(mean.with_scale_round(scale, RoundingMode::HalfEven))
    }
}

impl Default for BucketAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Averages samples into fixed-width buckets
#[derive(Debug, Clone)]
pub struct BucketAggregator {
    scale: i64,
}

impl BucketAggregator {
    /// Create an aggregator rounding to [`DEFAULT_VALUE_SCALE`] digits
    pub fn new() -> Self {
        Self {
            scale: DEFAULT_VALUE_SCALE,
        }
    }

    /// Create an aggregator with a custom rounding scale
    pub fn with_scale(scale: i64) -> Self {
        Self { scale }
    }

    /// Rounding scale applied to every average
    pub fn scale(&self) -> i64 {
        self.scale
    }

    /// Average the points of a single sensor
    ///
    /// Points do not need to be sorted. Only buckets whose boundary lies
    /// between `bucket_start(start)` and `bucket_start(end)` (inclusive) are
    /// returned, in ascending order. Buckets without samples are omitted.
    pub fn aggregate(
        &self,
        sensor_id: SensorId,
        points: &[SeriesPoint],
        period_minutes: i64,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<BucketValue>> {
        self.aggregate_batch(
            points.iter().map(|p| (sensor_id, p)),
            period_minutes,
            start,
            end,
        )
    }

    /// Average points of several sensors at once
    ///
    /// The result is ordered by sensor id, then bucket boundary.
    pub fn aggregate_batch<'a, I>(
        &self,
        points: I,
        period_minutes: i64,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<BucketValue>>
    where
        I: IntoIterator<Item = (SensorId, &'a SeriesPoint)>,
    {
        // Validates the period even when there is nothing to aggregate
        bucket_start(0, period_minutes)?;
        let lower = start.map(|t| bucket_start(t, period_minutes)).transpose()?;
        let upper = end.map(|t| bucket_start(t, period_minutes)).transpose()?;

        let mut buckets: BTreeMap<(SensorId, Timestamp), BucketAccumulator> = BTreeMap::new();
        for (sensor_id, point) in points {
            let boundary = bucket_start(point.measuring_at, period_minutes)?;
            if lower.is_some_and(|l| boundary < l) || upper.is_some_and(|u| boundary > u) {
                continue;
            }
            buckets
                .entry((sensor_id, boundary))
                .or_default()
                .add(&point.value);
        }

        Ok(buckets
            .into_iter()
            .filter_map(|((sensor_id, boundary), acc)| {
                acc.mean(self.scale).map(|value| BucketValue {
                    sensor_id,
                    bucket_start: boundary,
                    value,
                    samples: acc.count(),
                })
            })
            .collect())
    }
}

impl Default for BucketAggregator {
    fn default() -> Self {
        Self::new()
    }
}
