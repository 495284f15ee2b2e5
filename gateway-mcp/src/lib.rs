//! # MCP Gateway Core
//!
//! A Model Context Protocol (MCP) gateway engine. It accepts MCP client
//! connections over stdio, Server-Sent Events, or streamable HTTP,
//! multiplexes them onto configured upstream MCP services (each reachable
//! over any of the same transports), and exposes each upstream as one or
//! more proxies: named endpoints with an independent, optionally filtered
//! tool surface. A proxy may bridge transports, e.g. an upstream spoken
//! over a child process presented outward as SSE.
//!
//! ## Architecture
//!
//! - [`compliance`] - Validation and normalization of MCP messages against
//!   protocol version 2025-03-26
//! - [`protocol`] - JSON-RPC 2.0 and MCP message types
//! - [`transport`] - Client adapters for the three upstream transports
//! - [`convert`] - Transport-pair conversion and tool-argument cleaning
//! - [`service`] - Upstream lifecycle, verification, and dispatch
//! - [`proxy`] - Filtered tool exposure and request fan-out
//! - [`session`] - SSE session engine: rate limits, pending queues,
//!   heartbeats, cleanup
//! - [`gateway`] - Axum entry points the host mounts
//! - [`error`] - Error taxonomy with fixed JSON-RPC codes
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gateway_config::GatewayConfig;
//! use gateway_mcp::gateway::{routes, GatewayContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: GatewayConfig = serde_json::from_str(r#"{
//!         "services": [{"name": "files", "command": "npx",
//!                       "args": ["-y", "@modelcontextprotocol/server-filesystem"],
//!                       "auto_start": true}],
//!         "proxies":  [{"name": "files", "server_name": "files", "auto_start": true}]
//!     }"#).unwrap();
//!
//!     let ctx = GatewayContext::from_config(config).await;
//!     ctx.startup().await;
//!
//!     let app = axum::Router::new().merge(routes()).with_state(ctx);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod compliance;
pub mod convert;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod session;
pub mod transport;

#[cfg(feature = "handlers")]
pub mod gateway;

// Re-export commonly used types
pub use error::{McpError, McpResult};

// Re-export protocol types
pub use protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpMethod, Tool, MCP_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};

// Re-export managers
pub use proxy::{ProxyManager, ProxyStatus};
pub use service::{ServiceManager, ServiceStatus};
pub use session::heartbeat::HeartbeatManager;
pub use session::SessionEngine;

// Re-export transport surface
pub use transport::{McpConnector, CALL_TIMEOUT};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::error::{McpError, McpResult};
    pub use crate::protocol::{JsonRpcRequest, JsonRpcResponse, Tool};
    pub use crate::proxy::ProxyManager;
    pub use crate::service::ServiceManager;
    pub use crate::session::SessionEngine;
    pub use crate::transport::McpConnector;

    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _error: McpError = McpError::Internal {
            message: "test".to_string(),
        };
        assert_eq!(MCP_PROTOCOL_VERSION, "2025-03-26");
        assert!(SUPPORTED_PROTOCOL_VERSIONS.contains(&"2024-11-05"));
    }
}
