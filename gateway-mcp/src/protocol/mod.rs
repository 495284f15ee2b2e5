//! MCP protocol implementation including JSON-RPC 2.0 and MCP-specific message types

pub mod jsonrpc;
pub mod messages;

pub use jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
pub use messages::{
    ClientInfo, InitializeParams, InitializeResult, McpMethod, ResourcesCapability, ServerCapabilities,
    ServerInfo, Tool, ToolsCallParams, ToolsCapability, ToolsListResult,
};

use serde_json::Value;
use uuid::Uuid;

/// Canonical MCP protocol version spoken by the gateway
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Protocol versions the gateway will echo back when a client offers them
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];

/// Generate a new request ID
pub fn generate_request_id() -> Value {
    Value::String(Uuid::new_v4().to_string())
}

/// Pick the protocol version to answer an initialize request with: the
/// client's version when supported, else the canonical default.
pub fn negotiate_protocol_version(client_version: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == client_version)
        .copied()
        .unwrap_or(MCP_PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_protocol_version("2025-03-26"), "2025-03-26");
        assert_eq!(negotiate_protocol_version("1999-01-01"), MCP_PROTOCOL_VERSION);
        assert_eq!(negotiate_protocol_version(""), MCP_PROTOCOL_VERSION);
    }

    #[test]
    fn test_generate_request_id_is_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
