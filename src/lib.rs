//! # sensor-rollup - Incremental time-bucket rollups
//!
//! Turns per-minute sensor readings into 30 minute, hourly, 6 hour, 12 hour
//! and daily averages, one closed window at a time.
//!
//! ## Key Features
//!
//! - **Right-closed buckets**: a sample at `t` belongs to the window closing at
//!   `ceil(t / w) * w`
//! - **Closed windows only**: a bucket is written once its boundary is in the past
//!   relative to the sensor's latest raw sample
//! - **Cursor per sensor and period**: every tick resumes where the last one
//!   committed, catching up over any number of missed windows
//! - **Batch independence**: a failing sensor never blocks the others and is
//!   retried on the next tick
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use bigdecimal::BigDecimal;
//! use sensor_rollup::{MemoryStore, PeriodType, RollupEngine, SeriesStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.add_sensor(1, 1);
//! for (t, v) in [(60, 1), (120, 2), (180, 3), (240, 4), (3660, 9)] {
//!     store.insert_raw(1, t, BigDecimal::from(v)).unwrap();
//! }
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let engine = RollupEngine::new(Arc::clone(&store));
//!     let report = engine.run_rollup(PeriodType::Hour).await.unwrap();
//!     assert_eq!(report.buckets_written, 1);
//!
//!     let hourly = store
//!         .read_aggregate(1, PeriodType::Hour, None, None)
//!         .await
//!         .unwrap();
//!     assert_eq!(hourly[0].measuring_at, 3600);
//!     assert_eq!(hourly[0].value, "2.5".parse::<BigDecimal>().unwrap());
//! });
//! ```
//!
//! ## Modules
//!
//! - [`period`]: Period catalog and bucket boundary arithmetic
//! - [`aggregator`]: Exact decimal averaging into buckets
//! - [`cursor`]: Due-sensor selection and cursor advancement
//! - [`engine`]: Concurrent per-period rollup ticks
//! - [`store`]: Persistence traits and the in-memory store
//! - [`query`]: Read path over raw and aggregated series
//! - [`metrics`]: Rollup statistics

// Modules
pub mod aggregator;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod period;
pub mod query;
pub mod report;
pub mod sample;
pub mod store;

// Re-exports for convenient access
pub use aggregator::{BucketAccumulator, BucketAggregator, DEFAULT_VALUE_SCALE};
pub use config::RollupConfig;
pub use cursor::CursorTracker;
pub use engine::RollupEngine;
pub use error::{ErrorKind, Result, RollupError};
pub use metrics::{PeriodMetrics, RollupMetrics};
pub use period::{bucket_start, PeriodType, ROLLUP_PERIODS, SECONDS_PER_MINUTE};
pub use query::SeriesQuery;
pub use report::{RunReport, SensorFailure};
pub use sample::{
    BucketValue, ContainerId, SensorCursor, SensorId, SensorSample, SeriesPoint, Timestamp,
};
pub use store::{CursorStore, MemoryStore, SeriesStore};

#[cfg(feature = "timestamps")]
pub use period::boundary_datetime;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
