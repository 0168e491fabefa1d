//! Persistence interfaces consumed by the engine
//!
//! [`SeriesStore`] holds every granularity of every sensor as one keyed
//! series `(sensor, period, timestamp)`; [`CursorStore`] holds the per-sensor
//! rollup progress. Both are implemented by collaborators (a database, a
//! remote service); [`MemoryStore`] implements both in memory for tests and
//! the reference scheduler.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::error::{Result, RollupError};
use crate::period::PeriodType;
use crate::sample::{ContainerId, SensorCursor, SensorId, SeriesPoint, Timestamp};

/// Storage of raw and aggregated points
#[async_trait]
pub trait SeriesStore: Send + Sync {
    /// Raw points with `from <= measuring_at <= to`, ascending
    async fn read_raw(
        &self,
        sensor_id: SensorId,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<SeriesPoint>>;

    /// Oldest raw point of a sensor
    async fn first_raw(&self, sensor_id: SensorId) -> Result<Option<SeriesPoint>>;

    /// Newest raw point with `measuring_at >= since`
    async fn latest_raw(
        &self,
        sensor_id: SensorId,
        since: Option<Timestamp>,
    ) -> Result<Option<SeriesPoint>>;

    /// Aggregated points with `from <= bucket_start <= to`, ascending
    async fn read_aggregate(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<SeriesPoint>>;

    /// Insert or overwrite the aggregate stored under the exact key
    async fn upsert_aggregate(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        bucket_start: Timestamp,
        value: BigDecimal,
    ) -> Result<()>;
}

/// Storage of per-sensor rollup cursors
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Cursor of one sensor
    async fn get(&self, sensor_id: SensorId) -> Result<SensorCursor>;

    /// Record the last boundary rolled up for `period`
    ///
    /// Cursors only move forward: when the stored boundary is already later
    /// than `last_update_periods_at`, it is kept.
    async fn set(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        last_update_periods_at: Timestamp,
    ) -> Result<()>;

    /// Cursors of every known sensor, ordered by sensor id
    async fn list(&self) -> Result<Vec<SensorCursor>>;
}

type SeriesKey = (SensorId, PeriodType, Timestamp);

#[derive(Debug, Default)]
struct MemoryState {
    series: BTreeMap<SeriesKey, BigDecimal>,
    sensors: BTreeMap<SensorId, SensorCursor>,
}

/// In-memory implementation of both store traits
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sensor; registering an existing sensor keeps its cursor
    pub fn add_sensor(&self, sensor_id: SensorId, container_id: ContainerId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .sensors
            .entry(sensor_id)
            .or_insert_with(|| SensorCursor::new(sensor_id, container_id));
    }

    /// Write a raw sample, overwriting one with the same timestamp
    ///
    /// Advances the sensor's `last_update_at`; unknown sensors are
    /// rejected.
    pub fn insert_raw(
        &self,
        sensor_id: SensorId,
        measuring_at: Timestamp,
        value: BigDecimal,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let sensor = state
            .sensors
            .get_mut(&sensor_id)
            .ok_or(RollupError::SensorNotFound(sensor_id))?;
        sensor.last_update_at = Some(
            sensor
                .last_update_at
                .map_or(measuring_at, |t| t.max(measuring_at)),
        );
        state
            .series
            .insert((sensor_id, PeriodType::Minute, measuring_at), value);
        Ok(())
    }

    /// Number of stored points for a sensor and granularity
    pub fn point_count(&self, sensor_id: SensorId, period: PeriodType) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .series
            .range(range_bounds(sensor_id, period, None, None))
            .count()
    }

    /// Number of stored aggregates across every rollup period
    pub fn aggregate_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .series
            .keys()
            .filter(|(_, period, _)| period.is_rollup())
            .count()
    }

    fn read_series(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Vec<SeriesPoint> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Vec::new();
            }
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .series
            .range(range_bounds(sensor_id, period, from, to))
            .map(|((_, _, t), v)| SeriesPoint::new(*t, v.clone()))
            .collect()
    }

    fn edge_point(
        &self,
        sensor_id: SensorId,
        from: Option<Timestamp>,
        newest: bool,
    ) -> Option<SeriesPoint> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut range = state
            .series
            .range(range_bounds(sensor_id, PeriodType::Minute, from, None));
        let entry = if newest { range.next_back() } else { range.next() };
        entry.map(|((_, _, t), v)| SeriesPoint::new(*t, v.clone()))
    }
}

fn range_bounds(
    sensor_id: SensorId,
    period: PeriodType,
    from: Option<Timestamp>,
    to: Option<Timestamp>,
) -> (Bound<SeriesKey>, Bound<SeriesKey>) {
    (
        Bound::Included((sensor_id, period, from.unwrap_or(Timestamp::MIN))),
        Bound::Included((sensor_id, period, to.unwrap_or(Timestamp::MAX))),
    )
}

#[async_trait]
impl SeriesStore for MemoryStore {
    async fn read_raw(
        &self,
        sensor_id: SensorId,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<SeriesPoint>> {
        Ok(self.read_series(sensor_id, PeriodType::Minute, from, to))
    }

    async fn first_raw(&self, sensor_id: SensorId) -> Result<Option<SeriesPoint>> {
        Ok(self.edge_point(sensor_id, None, false))
    }

    async fn latest_raw(
        &self,
        sensor_id: SensorId,
        since: Option<Timestamp>,
    ) -> Result<Option<SeriesPoint>> {
        Ok(self.edge_point(sensor_id, since, true))
    }

    async fn read_aggregate(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<SeriesPoint>> {
        if !period.is_rollup() {
            return Err(RollupError::InvalidPeriod(period.minutes()));
        }
        Ok(self.read_series(sensor_id, period, from, to))
    }

    async fn upsert_aggregate(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        bucket_start: Timestamp,
        value: BigDecimal,
    ) -> Result<()> {
        if !period.is_rollup() {
            return Err(RollupError::InvalidPeriod(period.minutes()));
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.series.insert((sensor_id, period, bucket_start), value);
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get(&self, sensor_id: SensorId) -> Result<SensorCursor> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .sensors
            .get(&sensor_id)
            .cloned()
            .ok_or(RollupError::SensorNotFound(sensor_id))
    }

    async fn set(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        last_update_periods_at: Timestamp,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let sensor = state
            .sensors
            .get_mut(&sensor_id)
            .ok_or(RollupError::SensorNotFound(sensor_id))?;
        let cursor = sensor.periods.entry(period).or_insert(last_update_periods_at);
        *cursor = (*cursor).max(last_update_periods_at);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SensorCursor>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.sensors.values().cloned().collect())
    }
}
