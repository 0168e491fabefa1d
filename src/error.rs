//! Error types for the rollup engine
//!
//! This module defines all error types used throughout the library.

use serde::Serialize;
use thiserror::Error;

use crate::period::PeriodType;
use crate::sample::SensorId;

/// Result type alias for rollup operations
pub type Result<T> = std::result::Result<T, RollupError>;

/// Main error type for rollup operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RollupError {
    /// Period is zero, negative or not a known granularity
    #[error("Invalid period: {0} minutes")]
    InvalidPeriod(i64),

    /// Persistence layer could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A persistence call did not complete in time
    #[error("Store call '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Sensor is unknown to the cursor store
    #[error("Sensor not found: {0}")]
    SensorNotFound(SensorId),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Some sensors of a rollup batch failed, the others were committed
    #[error("Rollup for period {period} committed {processed} sensors, {} failed", .failed.len())]
    PartialBatchFailure {
        period: PeriodType,
        processed: usize,
        failed: Vec<SensorId>,
    },
}

impl RollupError {
    /// Whether the next scheduled tick may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Timeout { .. })
    }

    /// Short machine-friendly label, used for metrics and reports
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPeriod(_) => ErrorKind::InvalidPeriod,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::SensorNotFound(_) => ErrorKind::SensorNotFound,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
        }
    }
}

/// Error category without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPeriod,
    StoreUnavailable,
    Timeout,
    SensorNotFound,
    InvalidConfig,
    PartialBatchFailure,
}

impl ErrorKind {
    /// Label as it appears in serialized reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPeriod => "invalid_period",
            Self::StoreUnavailable => "store_unavailable",
            Self::Timeout => "timeout",
            Self::SensorNotFound => "sensor_not_found",
            Self::InvalidConfig => "invalid_config",
            Self::PartialBatchFailure => "partial_batch_failure",
        }
    }
}
