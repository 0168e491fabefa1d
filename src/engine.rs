//! Rollup orchestration
//!
//! One [`RollupEngine::run_rollup`] call is one scheduler tick for one
//! period: select due sensors, aggregate every newly closed window, upsert
//! the buckets, then advance the sensor's cursor. Sensors are processed on a
//! bounded pool of tokio tasks; a failing sensor keeps its cursor and is
//! simply picked up again on the next tick.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::aggregator::BucketAggregator;
use crate::config::RollupConfig;
use crate::cursor::{select_due, CursorTracker};
use crate::error::{ErrorKind, Result, RollupError};
use crate::metrics::RollupMetrics;
use crate::period::PeriodType;
use crate::report::{RunReport, SensorFailure};
use crate::sample::{SensorCursor, SensorId, Timestamp};
use crate::store::{CursorStore, SeriesStore};

type PairKey = (SensorId, PeriodType);

/// What happened to one due sensor
#[derive(Debug, Clone, PartialEq, Eq)]
enum SensorOutcome {
    /// Buckets upserted and cursor moved to `boundary`
    Committed { buckets: usize, boundary: Timestamp },
    /// Next window still open
    Idle,
    /// Shutdown signalled before the sensor started
    Cancelled,
}

/// Marks a `(sensor, period)` pair as being rolled up in this process
struct InFlightGuard {
    set: Arc<Mutex<HashSet<PairKey>>>,
    key: PairKey,
}

impl InFlightGuard {
    fn claim(set: &Arc<Mutex<HashSet<PairKey>>>, key: PairKey) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        inserted.then(|| Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Everything a sensor task needs, shared across the batch
struct SensorJob<S> {
    store: Arc<S>,
    tracker: CursorTracker<S>,
    aggregator: BucketAggregator,
    period: PeriodType,
    store_timeout: Duration,
    max_catch_up_buckets: Option<u32>,
}

impl<S: SeriesStore + CursorStore> SensorJob<S> {
    /// Roll up every closed window of one sensor and advance its cursor
    async fn run(&self, cursor: &SensorCursor) -> Result<SensorOutcome> {
        let period = self.period;
        let sensor_id = cursor.sensor_id;
        let Some(last_update_at) = cursor.last_update_at else {
            return Ok(SensorOutcome::Idle);
        };

        let previous = cursor.period_cursor(period);
        let mut target = period.closed_boundary(last_update_at);
        if let Some(max) = self.max_catch_up_buckets {
            let Some(limit) = self.catch_up_limit(sensor_id, previous, max).await? else {
                return Ok(SensorOutcome::Idle);
            };
            target = target.min(limit);
        }
        if previous.is_some_and(|prev| target <= prev) {
            return Ok(SensorOutcome::Idle);
        }

        // Re-derive the window holding an unaligned cursor instead of
        // overwriting it with a partial average
        let from = previous.map(|prev| period.closed_boundary(prev) + 1);
        let points = bounded(
            self.store_timeout,
            "read_raw",
            self.store.read_raw(sensor_id, from, Some(target)),
        )
        .await?;
        let buckets =
            self.aggregator
                .aggregate(sensor_id, &points, period.minutes(), from, Some(target))?;

        for bucket in &buckets {
            bounded(
                self.store_timeout,
                "upsert_aggregate",
                self.store.upsert_aggregate(
                    sensor_id,
                    period,
                    bucket.bucket_start,
                    bucket.value.clone(),
                ),
            )
            .await?;
        }

        bounded(
            self.store_timeout,
            "advance_cursor",
            self.tracker.advance(sensor_id, period, target),
        )
        .await?;

        debug!(
            "sensor {} period {}: {} buckets from {} raw points, cursor {:?} -> {}",
            sensor_id,
            period,
            buckets.len(),
            points.len(),
            previous,
            target
        );
        Ok(SensorOutcome::Committed {
            buckets: buckets.len(),
            boundary: target,
        })
    }
}

impl<S: SeriesStore> SensorJob<S> {
    /// Last boundary this tick may close when at most `max` windows are allowed
    ///
    /// Counted from the cursor, or from the window of the oldest raw point on
    /// a first run. `None` when a first-run sensor has no raw point.
    async fn catch_up_limit(
        &self,
        sensor_id: SensorId,
        previous: Option<Timestamp>,
        max: u32,
    ) -> Result<Option<Timestamp>> {
        let width = self.period.seconds();
        let limit = match previous {
            Some(prev) => self
                .period
                .closed_boundary(prev)
                .saturating_add(i64::from(max).saturating_mul(width)),
            None => {
                let first = bounded(
                    self.store_timeout,
                    "first_raw",
                    self.store.first_raw(sensor_id),
                )
                .await?;
                let Some(first) = first else {
                    return Ok(None);
                };
                self.period
                    .bucket_start(first.measuring_at)
                    .saturating_add(i64::from(max.saturating_sub(1)).saturating_mul(width))
            }
        };
        Ok(Some(limit))
    }
}

/// Bound a store call by `limit`
async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RollupError::Timeout {
            operation,
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Orchestrates rollups over a store implementing both store traits
pub struct RollupEngine<S> {
    store: Arc<S>,
    tracker: CursorTracker<S>,
    aggregator: BucketAggregator,
    config: RollupConfig,
    in_flight: Arc<Mutex<HashSet<PairKey>>>,
    metrics: Mutex<RollupMetrics>,
}

impl<S> RollupEngine<S>
where
    S: SeriesStore + CursorStore + 'static,
{
    /// Create an engine with the default configuration
    pub fn new(store: Arc<S>) -> Self {
        Self::build(store, RollupConfig::default())
    }

    /// Create an engine with a validated configuration
    pub fn with_config(store: Arc<S>, config: RollupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(store, config))
    }

    fn build(store: Arc<S>, config: RollupConfig) -> Self {
        Self {
            tracker: CursorTracker::new(Arc::clone(&store)),
            aggregator: BucketAggregator::with_scale(config.value_scale),
            store,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            metrics: Mutex::new(RollupMetrics::new()),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    /// Cursor tracker sharing the engine's store
    pub fn tracker(&self) -> &CursorTracker<S> {
        &self.tracker
    }

    /// Snapshot of the cumulative metrics
    pub fn metrics(&self) -> RollupMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one tick for `period`
    pub async fn run_rollup(&self, period: PeriodType) -> Result<RunReport> {
        let (_keep_open, shutdown) = watch::channel(false);
        self.run_rollup_with_shutdown(period, shutdown).await
    }

    /// Run one tick for every configured period, ascending
    pub async fn run_all(&self) -> Vec<(PeriodType, Result<RunReport>)> {
        let mut results = Vec::new();
        for period in self.config.ordered_periods() {
            let result = self.run_rollup(period).await;
            results.push((period, result));
        }
        results
    }

    /// Run one tick for `period`, stopping early once `shutdown` turns true
    ///
    /// Sensors that have not started when shutdown is observed are reported
    /// as cancelled and keep their cursor. A sensor that already started
    /// writing runs to completion.
    pub async fn run_rollup_with_shutdown(
        &self,
        period: PeriodType,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        if !period.is_rollup() {
            return Err(RollupError::InvalidPeriod(period.minutes()));
        }

        let result = self.execute(period, shutdown).await;
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(report) => metrics.record_run(report),
            Err(_) => metrics.record_fatal(period),
        }
        result
    }

    async fn execute(
        &self,
        period: PeriodType,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        let due = self.select(period).await?;
        let mut report = RunReport::new(period);
        if due.is_empty() {
            debug!("period {}: no sensors due", period);
            return Ok(report);
        }

        let job = Arc::new(SensorJob {
            store: Arc::clone(&self.store),
            tracker: self.tracker.clone(),
            aggregator: self.aggregator.clone(),
            period,
            store_timeout: self.config.store_timeout,
            max_catch_up_buckets: self.config.max_catch_up_buckets,
        });
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut workers = JoinSet::new();
        let mut started = BTreeSet::new();

        for cursor in due {
            let sensor_id = cursor.sensor_id;
            let Some(guard) = InFlightGuard::claim(&self.in_flight, (sensor_id, period)) else {
                report.busy.push(sensor_id);
                continue;
            };
            started.insert(sensor_id);

            let job = Arc::clone(&job);
            let permits = Arc::clone(&permits);
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                let _guard = guard;
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        let cancelled = *shutdown.borrow();
                        if cancelled {
                            Ok(SensorOutcome::Cancelled)
                        } else {
                            job.run(&cursor).await
                        }
                    }
                    Err(_) => Err(RollupError::StoreUnavailable(
                        "worker pool closed".to_string(),
                    )),
                };
                (sensor_id, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            let (sensor_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("period {}: rollup worker aborted: {}", period, e);
                    continue;
                }
            };
            started.remove(&sensor_id);
            match outcome {
                Ok(SensorOutcome::Committed { buckets, .. }) => {
                    report.processed += 1;
                    report.buckets_written += buckets;
                }
                Ok(SensorOutcome::Idle) => report.idle.push(sensor_id),
                Ok(SensorOutcome::Cancelled) => report.cancelled.push(sensor_id),
                Err(e) => {
                    warn!("period {}: sensor {} not rolled up: {}", period, sensor_id, e);
                    report.failed.push(SensorFailure::new(sensor_id, &e));
                }
            }
        }

        // Workers that never reported back
        for sensor_id in started {
            report.failed.push(SensorFailure::new(
                sensor_id,
                &RollupError::StoreUnavailable("rollup worker aborted".to_string()),
            ));
        }
        report.normalize();

        // Busy or cancelled sensors were never tried against the store
        if report.processed == 0
            && report.idle.is_empty()
            && report.busy.is_empty()
            && report.cancelled.is_empty()
            && !report.failed.is_empty()
            && report
                .failed
                .iter()
                .all(|f| f.kind == ErrorKind::StoreUnavailable)
        {
            warn!(
                "period {}: store unreachable for all {} sensors",
                period,
                report.failed.len()
            );
            return Err(RollupError::StoreUnavailable(format!(
                "all {} due sensors failed: {}",
                report.failed.len(),
                report.failed[0].message
            )));
        }

        info!(
            "period {}: {} sensors rolled up, {} buckets, {} idle, {} failed, {} skipped",
            period,
            report.processed,
            report.buckets_written,
            report.idle.len(),
            report.failed.len(),
            report.busy.len() + report.cancelled.len()
        );
        Ok(report)
    }

    /// Due sensors: first-run sensors, then each cursor group ascending
    async fn select(&self, period: PeriodType) -> Result<Vec<SensorCursor>> {
        let cursors = bounded(self.config.store_timeout, "list_cursors", self.store.list()).await?;

        let boundaries: BTreeSet<Timestamp> = cursors
            .iter()
            .filter_map(|c| c.period_cursor(period))
            .collect();

        let mut due = select_due(&cursors, period, None);
        for as_of in boundaries {
            due.extend(select_due(&cursors, period, Some(as_of)));
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn store_with(sensors: &[SensorId]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in sensors {
            store.add_sensor(*id, 1);
        }
        store
    }

    #[tokio::test]
    async fn test_empty_store_is_a_noop() {
        let engine = RollupEngine::new(Arc::new(MemoryStore::new()));
        let report = engine.run_rollup(PeriodType::Hour).await.unwrap();
        assert_eq!(report, RunReport::new(PeriodType::Hour));
    }

    #[tokio::test]
    async fn test_raw_period_rejected() {
        let engine = RollupEngine::new(Arc::new(MemoryStore::new()));
        assert_eq!(
            engine.run_rollup(PeriodType::Minute).await,
            Err(RollupError::InvalidPeriod(1))
        );
    }

    #[tokio::test]
    async fn test_first_run_averages_closed_windows() {
        let store = store_with(&[1]);
        for (t, v) in [(60, "1"), (120, "2"), (180, "3"), (240, "4"), (3660, "10")] {
            store.insert_raw(1, t, dec(v)).unwrap();
        }
        let engine = RollupEngine::new(Arc::clone(&store));

        let report = engine.run_rollup(PeriodType::Hour).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.buckets_written, 1);
        let stored = store
            .read_aggregate(1, PeriodType::Hour, None, None)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].measuring_at, 3600);
        assert_eq!(stored[0].value, dec("2.5"));
        let cursor = store.get(1).await.unwrap();
        assert_eq!(cursor.period_cursor(PeriodType::Hour), Some(3600));
    }

    #[tokio::test]
    async fn test_open_window_is_idle() {
        let store = store_with(&[1]);
        store.insert_raw(1, 3600, dec("1")).unwrap();
        let engine = RollupEngine::new(Arc::clone(&store));
        engine.run_rollup(PeriodType::Hour).await.unwrap();

        store.insert_raw(1, 4000, dec("2")).unwrap();
        let report = engine.run_rollup(PeriodType::Hour).await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.idle, vec![1]);
        assert_eq!(store.point_count(1, PeriodType::Hour), 1);
    }

    #[tokio::test]
    async fn test_catch_up_limit_does_not_skip_windows() {
        let store = store_with(&[1]);
        store.insert_raw(1, 3600, dec("1")).unwrap();
        let config = RollupConfig {
            periods: vec![PeriodType::Hour],
            max_catch_up_buckets: Some(2),
            ..Default::default()
        };
        let engine = RollupEngine::with_config(Arc::clone(&store), config).unwrap();
        engine.run_rollup(PeriodType::Hour).await.unwrap();

        for hour in 2..=6 {
            store.insert_raw(1, hour * 3600, dec("5")).unwrap();
        }

        let first = engine.run_rollup(PeriodType::Hour).await.unwrap();
        let second = engine.run_rollup(PeriodType::Hour).await.unwrap();
        let third = engine.run_rollup(PeriodType::Hour).await.unwrap();

        assert_eq!(first.buckets_written, 2);
        assert_eq!(second.buckets_written, 2);
        assert_eq!(third.buckets_written, 1);
        let stored = store
            .read_aggregate(1, PeriodType::Hour, None, None)
            .await
            .unwrap();
        let times: Vec<_> = stored.iter().map(|p| p.measuring_at / 3600).collect();
        assert_eq!(times, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_catch_up_limit_applies_on_first_run() {
        let store = store_with(&[1]);
        for hour in 1..=10 {
            store.insert_raw(1, hour * 3600, dec("3")).unwrap();
        }
        let config = RollupConfig {
            periods: vec![PeriodType::Hour],
            max_catch_up_buckets: Some(2),
            ..Default::default()
        };
        let engine = RollupEngine::with_config(Arc::clone(&store), config).unwrap();

        let first = engine.run_rollup(PeriodType::Hour).await.unwrap();
        assert_eq!(first.buckets_written, 2);
        let cursor = store.get(1).await.unwrap();
        assert_eq!(cursor.period_cursor(PeriodType::Hour), Some(7200));

        let mut ticks = 1;
        while store.point_count(1, PeriodType::Hour) < 10 {
            let report = engine.run_rollup(PeriodType::Hour).await.unwrap();
            assert!(report.buckets_written <= 2);
            ticks += 1;
        }
        assert_eq!(ticks, 5);
        let cursor = store.get(1).await.unwrap();
        assert_eq!(cursor.period_cursor(PeriodType::Hour), Some(36_000));
    }

    #[tokio::test]
    async fn test_busy_pair_is_skipped() {
        let store = store_with(&[1]);
        store.insert_raw(1, 7200, dec("1")).unwrap();
        let engine = RollupEngine::new(Arc::clone(&store));

        let guard = InFlightGuard::claim(&engine.in_flight, (1, PeriodType::Hour));
        assert!(guard.is_some());
        let report = engine.run_rollup(PeriodType::Hour).await.unwrap();
        assert_eq!(report.busy, vec![1]);
        assert_eq!(store.aggregate_count(), 0);

        drop(guard);
        let report = engine.run_rollup(PeriodType::Hour).await.unwrap();
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_sensors() {
        let store = store_with(&[1, 2, 3]);
        for id in 1..=3 {
            store.insert_raw(id, 7200, dec("1")).unwrap();
        }
        let engine = RollupEngine::new(Arc::clone(&store));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = engine
            .run_rollup_with_shutdown(PeriodType::Hour, rx)
            .await
            .unwrap();

        assert_eq!(report.cancelled, vec![1, 2, 3]);
        assert_eq!(report.processed, 0);
        assert_eq!(store.aggregate_count(), 0);
        let cursor = store.get(2).await.unwrap();
        assert_eq!(cursor.period_cursor(PeriodType::Hour), None);
    }

    #[tokio::test]
    async fn test_run_all_orders_periods_and_records_metrics() {
        let store = store_with(&[1]);
        for minute in 1..=(24 * 60) {
            store.insert_raw(1, minute * 60, dec("2")).unwrap();
        }
        let engine = RollupEngine::new(Arc::clone(&store));

        let results = engine.run_all().await;

        let periods: Vec<_> = results.iter().map(|(p, _)| p.minutes()).collect();
        assert_eq!(periods, vec![30, 60, 360, 720, 1440]);
        let written: Vec<_> = results
            .iter()
            .map(|(_, r)| r.as_ref().unwrap().buckets_written)
            .collect();
        assert_eq!(written, vec![48, 24, 4, 2, 1]);
        assert_eq!(engine.metrics().total_buckets_written(), 79);

        let cursor = store.get(1).await.unwrap();
        assert_eq!(cursor.last_update_periods_at(), Some(86_400));
    }
}
