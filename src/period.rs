//! Rollup periods and bucket-boundary arithmetic
//!
//! A bucket is identified by its *closing* boundary: the bucket ending at
//! `B` covers the half-open window `(B - width, B]`. Boundaries are
//! multiples of the period width counted from the Unix epoch, so every
//! sensor shares the same grid.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RollupError};
use crate::sample::Timestamp;

/// Seconds in one minute
pub const SECONDS_PER_MINUTE: i64 = 60;

/// Granularity of a series, in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum PeriodType {
    /// Raw per-minute samples (base granularity, never a rollup target)
    Minute,
    /// 30 minutes
    HalfOfHour,
    /// 60 minutes
    Hour,
    /// 6 hours
    QuarterOfDay,
    /// 12 hours
    HalfOfDay,
    /// 24 hours
    Day,
}

/// Rollup targets in ascending order
pub const ROLLUP_PERIODS: [PeriodType; 5] = [
    PeriodType::HalfOfHour,
    PeriodType::Hour,
    PeriodType::QuarterOfDay,
    PeriodType::HalfOfDay,
    PeriodType::Day,
];

impl PeriodType {
    /// Width in minutes
    pub const fn minutes(self) -> i64 {
        match self {
            Self::Minute => 1,
            Self::HalfOfHour => 30,
            Self::Hour => 60,
            Self::QuarterOfDay => 360,
            Self::HalfOfDay => 720,
            Self::Day => 1440,
        }
    }

    /// Width in seconds
    pub const fn seconds(self) -> i64 {
        self.minutes() * SECONDS_PER_MINUTE
    }

    /// All rollup targets, ascending
    pub fn rollups() -> &'static [PeriodType] {
        &ROLLUP_PERIODS
    }

    /// Whether the engine produces this series (everything but raw)
    pub fn is_rollup(self) -> bool {
        self != Self::Minute
    }

    /// Next finer granularity, `None` for raw
    pub fn finer(self) -> Option<PeriodType> {
        match self {
            Self::Minute => None,
            Self::HalfOfHour => Some(Self::Minute),
            Self::Hour => Some(Self::HalfOfHour),
            Self::QuarterOfDay => Some(Self::Hour),
            Self::HalfOfDay => Some(Self::QuarterOfDay),
            Self::Day => Some(Self::HalfOfDay),
        }
    }

    /// Closing boundary of the bucket containing `t`
    ///
    /// Timestamps above the last representable boundary map to that boundary.
    pub fn bucket_start(self, t: Timestamp) -> Timestamp {
        ceil_to_multiple(t, self.seconds()).unwrap_or_else(|| self.closed_boundary(t))
    }

    /// Latest boundary at or before `t`: the newest window that is closed at `t`
    pub fn closed_boundary(self, t: Timestamp) -> Timestamp {
        t.div_euclid(self.seconds()) * self.seconds()
    }

    /// Window `(start, end]` of the bucket closing at `bucket_start`
    pub fn bucket_window(self, bucket_start: Timestamp) -> (Timestamp, Timestamp) {
        (bucket_start - self.seconds(), bucket_start)
    }

    /// Number of whole windows between two boundaries
    pub fn windows_between(self, from: Timestamp, to: Timestamp) -> i64 {
        if to <= from {
            return 0;
        }
        (to - from) / self.seconds()
    }
}

impl TryFrom<i64> for PeriodType {
    type Error = RollupError;

    fn try_from(minutes: i64) -> Result<Self> {
        match minutes {
            1 => Ok(Self::Minute),
            30 => Ok(Self::HalfOfHour),
            60 => Ok(Self::Hour),
            360 => Ok(Self::QuarterOfDay),
            720 => Ok(Self::HalfOfDay),
            1440 => Ok(Self::Day),
            other => Err(RollupError::InvalidPeriod(other)),
        }
    }
}

impl From<PeriodType> for i64 {
    fn from(period: PeriodType) -> i64 {
        period.minutes()
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minutes())
    }
}

/// `ceil(t / (period_minutes * 60)) * period_minutes * 60`
///
/// For the catalog granularities prefer [`PeriodType::bucket_start`], which
/// cannot fail. A non-positive period, or a `t` whose closing boundary does
/// not fit in a timestamp, is `InvalidPeriod`.
pub fn bucket_start(t: Timestamp, period_minutes: i64) -> Result<Timestamp> {
    if period_minutes <= 0 {
        return Err(RollupError::InvalidPeriod(period_minutes));
    }
    let width = period_minutes
        .checked_mul(SECONDS_PER_MINUTE)
        .ok_or(RollupError::InvalidPeriod(period_minutes))?;
    ceil_to_multiple(t, width).ok_or(RollupError::InvalidPeriod(period_minutes))
}

fn ceil_to_multiple(t: Timestamp, width: i64) -> Option<Timestamp> {
    let quotient = t.div_euclid(width);
    if t.rem_euclid(width) == 0 {
        quotient.checked_mul(width)
    } else {
        quotient.checked_add(1)?.checked_mul(width)
    }
}

/// Convert a boundary to a UTC datetime
#[cfg(feature = "timestamps")]
pub fn boundary_datetime(t: Timestamp) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(t, 0)
}
