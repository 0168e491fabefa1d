//! Stress tests for sensor-rollup
//!
//! Run with: cargo test --release stress -- --ignored

use std::sync::Arc;
use std::time::Instant;

use bigdecimal::BigDecimal;
use rand::Rng;
use sensor_rollup::*;

/// `sensors` sensors with one sample per minute over `days` days
fn seeded_store(sensors: SensorId, days: i64) -> Arc<MemoryStore> {
    let mut rng = rand::thread_rng();
    let store = Arc::new(MemoryStore::new());
    for id in 1..=sensors {
        store.add_sensor(id, id % 10);
        for minute in 1..=(days * 24 * 60) {
            let value = BigDecimal::from(rng.gen_range(-5_000..45_000i64)) / BigDecimal::from(1000);
            store.insert_raw(id, minute * 60, value).unwrap();
        }
    }
    store
}

#[test]
#[ignore] // Run manually with --ignored
fn stress_test_aggregation() {
    let mut rng = rand::thread_rng();
    let points: Vec<SeriesPoint> = (0..1_000_000)
        .map(|i| SeriesPoint::new(i * 60, BigDecimal::from(rng.gen_range(0..10_000i64))))
        .collect();
    let aggregator = BucketAggregator::new();

    let start = Instant::now();
    let buckets = aggregator
        .aggregate(1, &points, PeriodType::Hour.minutes(), None, None)
        .unwrap();
    let elapsed = start.elapsed();
    let rate = points.len() as f64 / elapsed.as_secs_f64();

    println!("Aggregated {} points into {} buckets in {:?}", points.len(), buckets.len(), elapsed);
    println!("Rate: {:.0} points/second", rate);

    // the sample at 0 closes its own window, the rest fill 16667 hours
    assert_eq!(buckets.len(), 16_668);
    assert!(
        rate > 200_000.0,
        "Should aggregate at least 200k points/s, got {:.0}",
        rate
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn stress_test_fleet_rollup() {
    let store = seeded_store(200, 2);
    let engine = RollupEngine::with_config(Arc::clone(&store), RollupConfig::with_concurrency(16))
        .unwrap();

    let start = Instant::now();
    let results = engine.run_all().await;
    let elapsed = start.elapsed();

    for (period, result) in &results {
        let report = result.as_ref().unwrap();
        assert_eq!(report.processed, 200, "period {}", period);
        assert!(report.is_complete());
    }

    // 96 + 48 + 8 + 4 + 2 buckets per sensor over two days
    let written = engine.metrics().total_buckets_written();
    assert_eq!(written, 200 * 158);
    println!("Rolled up 200 sensors x 2 days in {:?} ({} buckets)", elapsed, written);
    println!("{}", engine.metrics().report());

    for id in [1, 100, 200] {
        let cursor = store.get(id).await.unwrap();
        assert_eq!(cursor.last_update_periods_at(), Some(2 * 86_400));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn stress_test_incremental_ticks() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=50 {
        store.add_sensor(id, 1);
    }
    let engine = RollupEngine::new(Arc::clone(&store));

    // One tick per simulated half hour over three days
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    for step in 1..=(3 * 48) {
        for id in 1..=50 {
            for minute in ((step - 1) * 30 + 1)..=(step * 30) {
                let value = BigDecimal::from(rng.gen_range(0..100i64));
                store.insert_raw(id, minute * 60, value).unwrap();
            }
        }
        for (_, result) in engine.run_all().await {
            assert!(result.unwrap().failed.is_empty());
        }
    }
    let elapsed = start.elapsed();

    println!("{} ticks in {:?}", 3 * 48 * 5, elapsed);
    let stats = engine.metrics();
    assert_eq!(stats.period(PeriodType::HalfOfHour).buckets_written, 50 * 3 * 48);
    assert_eq!(stats.period(PeriodType::Day).buckets_written, 50 * 3);
    assert_eq!(stats.failure_rate(), 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn stress_test_grouped_queries() {
    let store = seeded_store(20, 7);
    let query = SeriesQuery::new(store);
    let ids: Vec<SensorId> = (1..=20).collect();

    let start = Instant::now();
    let buckets = query
        .sensor_data_by_period(&ids, 60, Some(86_400), Some(6 * 86_400))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    println!("Grouped {} buckets in {:?}", buckets.len(), elapsed);
    // windows closing at 86400 through 518400 inclusive
    assert_eq!(buckets.len(), 20 * (5 * 24 + 1));
}
