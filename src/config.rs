//! Configuration types for the rollup engine

use std::time::Duration;

use crate::aggregator::DEFAULT_VALUE_SCALE;
use crate::error::{Result, RollupError};
use crate::period::{PeriodType, ROLLUP_PERIODS};

/// Engine-level configuration
#[derive(Debug, Clone)]
pub struct RollupConfig {
    /// Periods rolled up by [`run_all`](crate::RollupEngine::run_all), ascending
    pub periods: Vec<PeriodType>,

    /// Maximum sensors processed concurrently within one tick
    pub max_concurrency: usize,

    /// Upper bound on every store call
    pub store_timeout: Duration,

    /// Maximum windows closed per sensor per tick (`None` = catch up fully)
    pub max_catch_up_buckets: Option<u32>,

    /// Fractional digits kept on averages
    pub value_scale: i64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            periods: ROLLUP_PERIODS.to_vec(),
            max_concurrency: 8,
            store_timeout: Duration::from_secs(5),
            max_catch_up_buckets: None,
            value_scale: DEFAULT_VALUE_SCALE,
        }
    }
}

impl RollupConfig {
    /// Create a configuration with a custom worker pool size
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Default::default()
        }
    }

    /// Create a configuration with a custom store timeout
    pub fn with_store_timeout(store_timeout: Duration) -> Self {
        Self {
            store_timeout,
            ..Default::default()
        }
    }

    /// Create a configuration limited to the given periods
    pub fn with_periods(periods: &[PeriodType]) -> Self {
        Self {
            periods: periods.to_vec(),
            ..Default::default()
        }
    }

    /// Check the configuration before building an engine
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(RollupError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(RollupError::InvalidConfig(
                "store_timeout must be positive".to_string(),
            ));
        }
        if self.max_catch_up_buckets == Some(0) {
            return Err(RollupError::InvalidConfig(
                "max_catch_up_buckets must be at least 1".to_string(),
            ));
        }
        if self.value_scale < 0 {
            return Err(RollupError::InvalidConfig(format!(
                "value_scale must not be negative, got {}",
                self.value_scale
            )));
        }
        if let Some(raw) = self.periods.iter().find(|p| !p.is_rollup()) {
            return Err(RollupError::InvalidPeriod(raw.minutes()));
        }
        Ok(())
    }

    /// Configured periods sorted ascending without duplicates
    pub fn ordered_periods(&self) -> Vec<PeriodType> {
        let mut periods = self.periods.clone();
        periods.sort();
        periods.dedup();
        periods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RollupConfig::default();
        assert_eq!(config.periods.len(), 5);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert!(config.max_catch_up_buckets.is_none());
        assert_eq!(config.value_scale, 14);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(RollupConfig::with_concurrency(0).validate().is_err());
        assert!(RollupConfig::with_store_timeout(Duration::ZERO)
            .validate()
            .is_err());

        let raw = RollupConfig::with_periods(&[PeriodType::Minute]);
        assert_eq!(raw.validate(), Err(RollupError::InvalidPeriod(1)));

        let config = RollupConfig {
            max_catch_up_buckets: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ordered_periods() {
        let config = RollupConfig::with_periods(&[
            PeriodType::Day,
            PeriodType::HalfOfHour,
            PeriodType::Day,
        ]);
        assert_eq!(
            config.ordered_periods(),
            vec![PeriodType::HalfOfHour, PeriodType::Day]
        );
    }
}
