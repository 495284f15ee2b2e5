//! Heartbeat configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::utils::{default_true, serde_duration};
use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Tuning for the per-session SSE heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Base interval between ping frames
    #[serde(with = "serde_duration", alias = "heartbeatIntervalSeconds", alias = "heartbeat_interval_seconds")]
    pub interval: Duration,

    /// Tick granularity of the heartbeat/drain loop
    #[serde(with = "serde_duration", alias = "checkIntervalSeconds")]
    pub check_interval: Duration,

    /// How often a session logs a heartbeat summary line
    #[serde(with = "serde_duration", alias = "logIntervalSeconds")]
    pub log_interval: Duration,

    /// Response time above which a session counts as slow
    #[serde(alias = "responseTimeThresholdMs")]
    pub response_time_threshold_ms: f64,

    /// Error rate above which a session counts as unhealthy
    #[serde(alias = "errorRateThresholdPercent")]
    pub error_rate_threshold_percent: f64,

    /// Enables interval adaptation from metrics and load
    #[serde(default = "default_true", alias = "adaptiveEnabled")]
    pub adaptive_enabled: bool,

    /// Lower bound for the adaptive interval
    #[serde(with = "serde_duration", alias = "minIntervalSeconds")]
    pub min_interval: Duration,

    /// Upper bound for the adaptive interval
    #[serde(with = "serde_duration", alias = "maxIntervalSeconds")]
    pub max_interval: Duration,

    /// Stretch the interval under high system load
    #[serde(default = "default_true", alias = "loadBasedAdjustment")]
    pub load_based_adjustment: bool,

    /// Stretch the interval when the error rate is high
    #[serde(default = "default_true", alias = "errorBasedAdjustment")]
    pub error_based_adjustment: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
            log_interval: Duration::from_secs(60),
            response_time_threshold_ms: 1000.0,
            error_rate_threshold_percent: 5.0,
            adaptive_enabled: true,
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            load_based_adjustment: true,
            error_based_adjustment: true,
        }
    }
}

impl Validatable for HeartbeatConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.interval.is_zero() {
            return Err(self.validation_error("interval must be greater than 0"));
        }
        if self.min_interval > self.max_interval {
            return Err(self.validation_error(format!(
                "min_interval ({:?}) must not exceed max_interval ({:?})",
                self.min_interval, self.max_interval
            )));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "heartbeat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_defaults() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.min_interval, Duration::from_secs(5));
        assert_eq!(config.max_interval, Duration::from_secs(30));
        assert!(config.adaptive_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_bounds_checked() {
        let config = HeartbeatConfig {
            min_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
