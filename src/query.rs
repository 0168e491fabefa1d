//! Read path over raw and aggregated series
//!
//! Dashboards and exports read through [`SeriesQuery`]: latest values,
//! container snapshots, raw ranges, on-the-fly grouping of raw data and the
//! stored rollup history.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::aggregator::BucketAggregator;
use crate::error::Result;
use crate::period::{bucket_start, PeriodType, SECONDS_PER_MINUTE};
use crate::sample::{BucketValue, ContainerId, SensorId, SensorSample, SeriesPoint, Timestamp};
use crate::store::{CursorStore, SeriesStore};

/// Query facade over a store implementing both store traits
pub struct SeriesQuery<S> {
    store: Arc<S>,
    aggregator: BucketAggregator,
}

impl<S: SeriesStore + CursorStore> SeriesQuery<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            aggregator: BucketAggregator::new(),
        }
    }

    /// Use a custom aggregator for grouped reads
    pub fn with_aggregator(store: Arc<S>, aggregator: BucketAggregator) -> Self {
        Self { store, aggregator }
    }

    /// Most recent raw value of a sensor, not older than `since`
    pub async fn latest_value(
        &self,
        sensor_id: SensorId,
        since: Option<Timestamp>,
    ) -> Result<Option<SeriesPoint>> {
        self.store.latest_raw(sensor_id, since).await
    }

    /// Raw values of every sensor of a container taken exactly at `time`
    pub async fn container_snapshot(
        &self,
        container_id: ContainerId,
        time: Timestamp,
    ) -> Result<Vec<SensorSample>> {
        let sensors: Vec<SensorId> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|c| c.container_id == container_id)
            .map(|c| c.sensor_id)
            .collect();

        let mut samples = Vec::new();
        for sensor_id in sensors {
            let points = self.store.read_raw(sensor_id, Some(time), Some(time)).await?;
            samples.extend(
                points
                    .into_iter()
                    .map(|p| SensorSample::raw(sensor_id, p.measuring_at, p.value)),
            );
        }
        Ok(samples)
    }

    /// Raw samples of several sensors between `start` and `end` (inclusive)
    ///
    /// Ordered by sensor id, then time. Duplicate ids are read once.
    pub async fn sensor_data(
        &self,
        sensor_ids: &[SensorId],
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> Result<Vec<SensorSample>> {
        let mut samples = Vec::new();
        for sensor_id in unique(sensor_ids) {
            let points = self.store.read_raw(sensor_id, Some(start), end).await?;
            samples.extend(
                points
                    .into_iter()
                    .map(|p| SensorSample::raw(sensor_id, p.measuring_at, p.value)),
            );
        }
        Ok(samples)
    }

    /// Average raw data of several sensors into `period_minutes` buckets
    ///
    /// Any positive width is accepted, not only the rollup catalog. Buckets
    /// are kept when their boundary lies between the boundaries of `start`
    /// and `end`; a window cut by `start` is still averaged over all its
    /// samples.
    pub async fn sensor_data_by_period(
        &self,
        sensor_ids: &[SensorId],
        period_minutes: i64,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Vec<BucketValue>> {
        let first = start.map(|t| bucket_start(t, period_minutes)).transpose()?;
        let last = end.map(|t| bucket_start(t, period_minutes)).transpose()?;
        // Earliest raw sample that can fall into the first kept bucket
        let from = first.map(|b| b - period_minutes * SECONDS_PER_MINUTE + 1);

        let mut series: Vec<(SensorId, Vec<SeriesPoint>)> = Vec::new();
        for sensor_id in unique(sensor_ids) {
            let points = self.store.read_raw(sensor_id, from, last).await?;
            series.push((sensor_id, points));
        }
        debug!(
            "grouping {} sensors by {} minutes over {:?}..{:?}",
            series.len(),
            period_minutes,
            first,
            last
        );

        self.aggregator.aggregate_batch(
            series
                .iter()
                .flat_map(|(id, points)| points.iter().map(move |p| (*id, p))),
            period_minutes,
            start,
            end,
        )
    }

    /// Buckets of one sensor from the window containing `start` onward
    pub async fn values_for_period(
        &self,
        sensor_id: SensorId,
        period_minutes: i64,
        start: Option<Timestamp>,
    ) -> Result<Vec<BucketValue>> {
        self.sensor_data_by_period(&[sensor_id], period_minutes, start, None)
            .await
    }

    /// Stored rollups of one sensor with `from <= bucket_start <= to`
    pub async fn history(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<SeriesPoint>> {
        self.store.read_aggregate(sensor_id, period, from, to).await
    }
}

fn unique(sensor_ids: &[SensorId]) -> BTreeSet<SensorId> {
    sensor_ids.iter().copied().collect()
}
