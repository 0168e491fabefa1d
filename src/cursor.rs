//! Cursor tracking
//!
//! Decides which sensors have a closed window waiting to be rolled up and
//! advances their cursors once the window is persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::period::PeriodType;
use crate::sample::{SensorCursor, SensorId, Timestamp};
use crate::store::CursorStore;

/// Selects due sensors and advances their cursors
#[derive(Debug)]
pub struct CursorTracker<C> {
    store: Arc<C>,
}

impl<C> Clone for CursorTracker<C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<C: CursorStore> CursorTracker<C> {
    /// Create a tracker over a cursor store
    pub fn new(store: Arc<C>) -> Self {
        Self { store }
    }

    /// Sensors whose next window for `period` may be closed
    ///
    /// Without `as_of`: sensors never rolled up for `period` that have raw
    /// data. With `as_of`: sensors whose cursor equals `as_of` and that
    /// have raw data strictly after it. Ordered by sensor id.
    pub async fn due_sensors(
        &self,
        period: PeriodType,
        as_of: Option<Timestamp>,
    ) -> Result<Vec<SensorCursor>> {
        let cursors = self.store.list().await?;
        Ok(select_due(&cursors, period, as_of))
    }

    /// Distinct cursor values recorded for `period`, ascending
    pub async fn pending_boundaries(&self, period: PeriodType) -> Result<BTreeSet<Timestamp>> {
        let cursors = self.store.list().await?;
        Ok(cursors
            .iter()
            .filter_map(|c| c.period_cursor(period))
            .collect())
    }

    /// Cursor of one sensor
    pub async fn cursor(&self, sensor_id: SensorId) -> Result<SensorCursor> {
        self.store.get(sensor_id).await
    }

    /// Boundary up to which every rollup of the sensor is complete
    pub async fn last_update_periods_at(&self, sensor_id: SensorId) -> Result<Option<Timestamp>> {
        Ok(self.store.get(sensor_id).await?.last_update_periods_at())
    }

    /// Move the cursor of `sensor_id` for `period` forward to `new_cursor`
    ///
    /// Returns `false` without writing when the stored cursor is already at
    /// or past `new_cursor`. A run that advanced the cursor further between
    /// the read and the write wins, since the store never moves a cursor
    /// backward. Call only after the aggregates up to `new_cursor` are
    /// persisted.
    pub async fn advance(
        &self,
        sensor_id: SensorId,
        period: PeriodType,
        new_cursor: Timestamp,
    ) -> Result<bool> {
        let current = self.store.get(sensor_id).await?.period_cursor(period);
        if current.is_some_and(|c| c >= new_cursor) {
            debug!(
                "cursor of sensor {} for period {} already at {:?}, not moving to {}",
                sensor_id, period, current, new_cursor
            );
            return Ok(false);
        }
        self.store.set(sensor_id, period, new_cursor).await?;
        Ok(true)
    }
}

/// Due-sensor rule applied to an already loaded cursor list
pub fn select_due(
    cursors: &[SensorCursor],
    period: PeriodType,
    as_of: Option<Timestamp>,
) -> Vec<SensorCursor> {
    let mut due: Vec<SensorCursor> = cursors
        .iter()
        .filter(|c| match as_of {
            None => c.period_cursor(period).is_none() && c.last_update_at.is_some(),
            Some(boundary) => {
                c.period_cursor(period) == Some(boundary) && c.has_data_after(boundary)
            }
        })
        .cloned()
        .collect();
    due.sort_by_key(|c| c.sensor_id);
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bigdecimal::BigDecimal;

    fn store_with_sensors() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=4 {
            store.add_sensor(id, 1);
        }
        store
    }

    #[tokio::test]
    async fn test_first_run_selects_unrolled_sensors_with_data() {
        let store = store_with_sensors();
        store.insert_raw(1, 100, BigDecimal::from(1)).unwrap();
        store.insert_raw(2, 100, BigDecimal::from(1)).unwrap();
        store.set(2, PeriodType::Hour, 0).await.unwrap();
        let tracker = CursorTracker::new(store);

        let due = tracker.due_sensors(PeriodType::Hour, None).await.unwrap();

        let ids: Vec<_> = due.iter().map(|c| c.sensor_id).collect();
        // 2 already has a cursor, 3 and 4 never received data
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_as_of_requires_matching_cursor_and_newer_data() {
        let store = store_with_sensors();
        for id in 1..=4 {
            store.insert_raw(id, 3600, BigDecimal::from(1)).unwrap();
        }
        store.insert_raw(1, 5000, BigDecimal::from(1)).unwrap();
        store.insert_raw(3, 5000, BigDecimal::from(1)).unwrap();
        store.set(1, PeriodType::Hour, 3600).await.unwrap();
        store.set(2, PeriodType::Hour, 3600).await.unwrap();
        store.set(3, PeriodType::Hour, 0).await.unwrap();
        let tracker = CursorTracker::new(store);

        let due = tracker
            .due_sensors(PeriodType::Hour, Some(3600))
            .await
            .unwrap();

        // 2 has no data past 3600, 3 sits at another boundary
        let ids: Vec<_> = due.iter().map(|c| c.sensor_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_cursors_are_per_period() {
        let store = store_with_sensors();
        store.insert_raw(1, 9000, BigDecimal::from(1)).unwrap();
        store.set(1, PeriodType::HalfOfHour, 7200).await.unwrap();
        let tracker = CursorTracker::new(store);

        let hour = tracker.due_sensors(PeriodType::Hour, None).await.unwrap();
        let half = tracker
            .due_sensors(PeriodType::HalfOfHour, Some(7200))
            .await
            .unwrap();

        assert_eq!(hour.len(), 1);
        assert_eq!(half.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_boundaries() {
        let store = store_with_sensors();
        store.set(1, PeriodType::Day, 86_400).await.unwrap();
        store.set(2, PeriodType::Day, 0).await.unwrap();
        store.set(3, PeriodType::Day, 86_400).await.unwrap();
        store.set(4, PeriodType::Hour, 3600).await.unwrap();
        let tracker = CursorTracker::new(store);

        let boundaries = tracker.pending_boundaries(PeriodType::Day).await.unwrap();

        assert_eq!(boundaries.into_iter().collect::<Vec<_>>(), vec![0, 86_400]);
    }

    #[tokio::test]
    async fn test_advance_never_moves_backward() {
        let store = store_with_sensors();
        let tracker = CursorTracker::new(store);

        assert!(tracker.advance(1, PeriodType::Hour, 7200).await.unwrap());
        assert!(!tracker.advance(1, PeriodType::Hour, 3600).await.unwrap());
        assert!(!tracker.advance(1, PeriodType::Hour, 7200).await.unwrap());

        let cursor = tracker.cursor(1).await.unwrap();
        assert_eq!(cursor.period_cursor(PeriodType::Hour), Some(7200));
    }

    #[tokio::test]
    async fn test_last_update_periods_at_is_minimum_over_periods() {
        let store = store_with_sensors();
        let tracker = CursorTracker::new(store);

        for period in PeriodType::rollups() {
            tracker.advance(1, *period, 86_400).await.unwrap();
        }
        tracker.advance(1, PeriodType::HalfOfHour, 90_000).await.unwrap();

        assert_eq!(tracker.last_update_periods_at(1).await.unwrap(), Some(86_400));
        assert_eq!(tracker.last_update_periods_at(2).await.unwrap(), None);
    }
}
