//! Error types for gateway operations

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for gateway operations
pub type McpResult<T> = Result<T, McpError>;

/// Gateway error types
///
/// Every variant maps onto the fixed JSON-RPC error taxonomy via
/// [`McpError::error_code`], so the wire code of an error never depends on
/// which component produced it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum McpError {
    /// Request body was not valid JSON
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// The JSON was not a valid JSON-RPC request object
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Unknown or filtered-out method
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    /// Invalid method parameters
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    /// MCP protocol violation
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Transport-level failure (I/O, broken connection, timeout)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Capability negotiation failure
    #[error("Capability error: {message}")]
    Capability { message: String },

    /// Resource access failure
    #[error("Resource error: {message}")]
    Resource { message: String },

    /// Tool invocation failure
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Transport conversion failure
    #[error("Conversion error ({source_transport} -> {target_transport}): {message}")]
    Conversion {
        source_transport: String,
        target_transport: String,
        message: String,
    },

    /// Message failed compliance validation
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Upstream call exceeded its deadline
    #[error("Timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Connection establishment failure
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Unknown service name
    #[error("Service not found: {name}")]
    ServiceNotFound { name: String },

    /// Unknown proxy name
    #[error("Proxy not found: {name}")]
    ProxyNotFound { name: String },

    /// SSE session errors
    #[error("Session error: {message}")]
    Session { message: String },

    /// Session creation denied by rate limiting
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after: Option<u64>,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl McpError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            McpError::Parse { .. } => StatusCode::BAD_REQUEST,
            McpError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            McpError::InvalidParams { .. } => StatusCode::BAD_REQUEST,
            McpError::Validation { .. } => StatusCode::BAD_REQUEST,
            McpError::Configuration { .. } => StatusCode::BAD_REQUEST,
            McpError::MethodNotFound { .. } => StatusCode::NOT_FOUND,
            McpError::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            McpError::ProxyNotFound { .. } => StatusCode::NOT_FOUND,
            McpError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            McpError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            McpError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            McpError::ConnectionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for JSON-RPC responses
    pub fn error_code(&self) -> i32 {
        match self {
            McpError::Parse { .. } => -32700,
            McpError::InvalidRequest { .. } => -32600,
            McpError::MethodNotFound { .. } => -32601,
            McpError::InvalidParams { .. } => -32602,
            McpError::Internal { .. } => -32603,
            McpError::Serialization { .. } => -32603,
            McpError::Session { .. } => -32603,
            McpError::Protocol { .. } => -32000,
            McpError::RateLimitExceeded { .. } => -32000,
            McpError::ServiceNotFound { .. } => -32000,
            McpError::ProxyNotFound { .. } => -32000,
            McpError::Transport { .. } => -32001,
            McpError::ConnectionFailed { .. } => -32001,
            McpError::Timeout { .. } => -32001,
            McpError::Configuration { .. } => -32001,
            McpError::Capability { .. } => -32002,
            McpError::Resource { .. } => -32003,
            McpError::Tool { .. } => -32004,
            McpError::Conversion { .. } => -32005,
            McpError::Validation { .. } => -32006,
        }
    }

    /// Create a sanitized error message for external clients
    pub fn client_message(&self) -> String {
        match self {
            McpError::MethodNotFound { method } => format!("Method '{}' not found", method),
            McpError::ProxyNotFound { name } => format!("Proxy '{}' not found", name),
            McpError::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
            McpError::Timeout { .. } => "Request timeout".to_string(),
            McpError::Parse { message }
            | McpError::InvalidRequest { message }
            | McpError::InvalidParams { message }
            | McpError::Validation { message }
            | McpError::Protocol { message } => message.clone(),
            McpError::Internal { .. } | McpError::Serialization { .. } | McpError::Session { .. } => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Error response body for plain HTTP endpoints
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for McpError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            McpError::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        };
        let body = ErrorResponse {
            error: self.client_message(),
            code: Some(self.error_code()),
            retry_after,
        };

        (status, Json(body)).into_response()
    }
}

// Standard error conversions
impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for McpError {
    fn from(err: url::ParseError) -> Self {
        McpError::Configuration {
            message: format!("Invalid URL: {}", err),
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            McpError::Timeout {
                timeout: Duration::from_secs(30),
            }
        } else if err.is_connect() {
            McpError::ConnectionFailed {
                message: err.to_string(),
            }
        } else {
            McpError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for McpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        McpError::Timeout {
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<anyhow::Error> for McpError {
    fn from(err: anyhow::Error) -> Self {
        McpError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<gateway_config::ConfigError> for McpError {
    fn from(err: gateway_config::ConfigError) -> Self {
        McpError::Configuration {
            message: err.to_string(),
        }
    }
}
