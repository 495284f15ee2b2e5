//! Domain-driven configuration for the MCP gateway
//!
//! This crate defines the parsed configuration records the gateway core
//! consumes: upstream service declarations, proxy declarations, session
//! rate limits, and heartbeat tuning. Reading and writing configuration
//! files is the host's job; this crate only deserializes already-parsed
//! JSON values, validates them, and normalizes portability hazards such
//! as machine-local absolute paths.
//!
//! Both snake_case and camelCase key spellings are accepted on import so
//! configurations written for other MCP hosts can be dropped in unchanged.

pub mod error;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};

// Re-export domain configurations
pub use domains::{
    heartbeat::HeartbeatConfig,
    proxies::{ProxiesFile, ProxyConfig},
    services::{ServiceConfig, ServicesFile, TransportKind},
    sessions::{RateLimitConfig, SessionConfig},
    GatewayConfig, ImportReport,
};

// Re-export utilities
pub use domains::utils::serde_duration;
