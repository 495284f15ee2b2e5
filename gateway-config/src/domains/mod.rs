//! Domain-specific configuration modules

pub mod heartbeat;
pub mod proxies;
pub mod services;
pub mod sessions;
pub mod utils;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Complete gateway configuration, assembled by the host from whatever
/// files or stores it keeps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Upstream MCP services
    pub services: Vec<services::ServiceConfig>,

    /// Outward-facing proxies
    pub proxies: Vec<proxies::ProxyConfig>,

    /// Session limits and cleanup tuning
    pub sessions: sessions::SessionConfig,

    /// Rate limiting for session creation
    #[serde(alias = "rateLimit")]
    pub rate_limit: sessions::RateLimitConfig,

    /// Heartbeat tuning
    pub heartbeat: heartbeat::HeartbeatConfig,
}

impl GatewayConfig {
    /// Validate every domain in the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        for service in &self.services {
            service.validate()?;
        }
        for proxy in &self.proxies {
            proxy.validate()?;
        }
        self.sessions.validate()?;
        self.rate_limit.validate()?;
        self.heartbeat.validate()?;
        Ok(())
    }
}

/// Outcome of a bulk configuration import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Entries accepted
    pub succeeded: usize,
    /// Entries rejected, with the reason per entry name
    pub failed: Vec<(String, String)>,
}

impl ImportReport {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, name: impl Into<String>, reason: impl ToString) {
        self.failed.push((name.into(), reason.to_string()));
    }
}
