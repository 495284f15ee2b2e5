//! SSE session limits and rate-limiting configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::utils::{default_true, serde_duration};
use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Session lifetime and cleanup tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity window after which a session expires
    #[serde(with = "serde_duration", alias = "sessionTimeoutSeconds", alias = "session_timeout_seconds")]
    pub session_timeout: Duration,

    /// How often the background cleanup task runs
    #[serde(with = "serde_duration", alias = "cleanupIntervalSeconds", alias = "cleanup_interval_seconds")]
    pub cleanup_interval: Duration,

    /// Pending-message queue bound before a session is considered leaky
    #[serde(alias = "maxPendingMessages")]
    pub max_pending_messages: usize,

    /// Default lifetime of a queued message before it is dropped
    #[serde(with = "serde_duration", alias = "messageTimeoutSeconds", alias = "message_timeout_seconds")]
    pub message_timeout: Duration,

    /// Grace period for sessions that never complete the initialize handshake
    #[serde(with = "serde_duration", alias = "uninitializedTimeoutSeconds", alias = "uninitialized_timeout_seconds")]
    pub uninitialized_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            max_pending_messages: 100,
            message_timeout: Duration::from_secs(30),
            uninitialized_timeout: Duration::from_secs(60),
        }
    }
}

impl Validatable for SessionConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.session_timeout.is_zero() {
            return Err(self.validation_error("session_timeout must be greater than 0"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(self.validation_error("cleanup_interval must be greater than 0"));
        }
        if self.max_pending_messages == 0 {
            return Err(self.validation_error("max_pending_messages must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "sessions"
    }
}

/// Rate limits applied when SSE sessions are created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Concurrent sessions one client IP may create inside the window
    #[serde(alias = "maxSessionsPerClient")]
    pub max_sessions_per_client: usize,

    /// Concurrent sessions attached to one proxy
    #[serde(alias = "maxSessionsPerProxy")]
    pub max_sessions_per_proxy: usize,

    /// Rolling window for per-client session counting
    #[serde(with = "serde_duration", alias = "sessionCreationWindowSeconds", alias = "session_creation_window_s")]
    pub session_creation_window: Duration,

    /// Extra sessions granted to clients that have been idle
    #[serde(alias = "burstAllowance")]
    pub burst_allowance: usize,

    /// Utilization fraction at which a warning is logged
    #[serde(alias = "warningThreshold")]
    pub warning_threshold: f64,

    /// Enables the burst allowance
    #[serde(default = "default_true", alias = "adaptiveScaling")]
    pub adaptive_scaling: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_client: 10,
            max_sessions_per_proxy: 50,
            session_creation_window: Duration::from_secs(60),
            burst_allowance: 3,
            warning_threshold: 0.8,
            adaptive_scaling: true,
        }
    }
}

impl Validatable for RateLimitConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_sessions_per_client == 0 {
            return Err(self.validation_error("max_sessions_per_client must be greater than 0"));
        }
        if self.max_sessions_per_proxy == 0 {
            return Err(self.validation_error("max_sessions_per_proxy must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.warning_threshold) {
            return Err(self.validation_error(format!(
                "warning_threshold must be within 0.0..=1.0, got {}",
                self.warning_threshold
            )));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "rate_limit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.max_pending_messages, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rate_limit_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_sessions_per_client, 10);
        assert_eq!(config.max_sessions_per_proxy, 50);
        assert_eq!(config.burst_allowance, 3);
        assert!(config.adaptive_scaling);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rate_limit_camel_case_keys() {
        let config: RateLimitConfig = serde_json::from_value(json!({
            "maxSessionsPerClient": 4,
            "sessionCreationWindowSeconds": 120
        }))
        .unwrap();
        assert_eq!(config.max_sessions_per_client, 4);
        assert_eq!(config.session_creation_window, Duration::from_secs(120));
    }

    #[test]
    fn test_warning_threshold_bounds() {
        let config = RateLimitConfig {
            warning_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
