//! Protocol conversion between the three MCP transports
//!
//! A proxy may present an upstream outward on a different transport than
//! the upstream itself speaks. For each (source, target) pair the converter
//! opens a one-shot session on the source transport, issues the requested
//! method, and formats the result the way the target transport frames
//! messages: `data: <json>\n\n` for SSE, a single JSON frame otherwise.

use serde_json::{json, Map, Value};
use tracing::{debug, error};

use gateway_config::{ServiceConfig, TransportKind};

use crate::compliance;
use crate::error::{McpError, McpResult};
use crate::transport;

/// Convert one client message: dispatch it upstream over the service's
/// transport and return the JSON-RPC response to frame for `target`.
pub async fn convert_message(config: &ServiceConfig, target: TransportKind, message: &Value) -> Value {
    let id = message.get("id").cloned();
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match dispatch_upstream(config, &method, message).await {
        Ok(result) => compliance::ensure_jsonrpc_response(json!({ "result": result }), id.as_ref()),
        Err(e) => handle_conversion_error(config.transport, target, id, &method, e),
    }
}

async fn dispatch_upstream(config: &ServiceConfig, method: &str, message: &Value) -> McpResult<Value> {
    if method.is_empty() {
        return Err(McpError::InvalidRequest {
            message: "message has no method".to_string(),
        });
    }

    let mut session = transport::open(config).await?;
    let outcome = async {
        session.initialize().await?;

        if method == "tools/list" {
            let tools = session.list_tools().await?;
            return Ok(json!({ "tools": tools }));
        }

        let mut params = message.get("params").cloned();
        if method == "tools/call" {
            params = params.map(clean_call_params);
        }
        session.call(method, params).await
    }
    .await;

    // One-shot sessions never outlive the call
    if let Err(e) = session.close().await {
        debug!(service = %config.name, "session close failed: {}", e);
    }

    outcome
}

/// Wrap a conversion failure into an MCP conversion error response carrying
/// both transport names so the failing leg is identifiable from the client.
pub fn handle_conversion_error(
    source: TransportKind,
    target: TransportKind,
    id: Option<Value>,
    method: &str,
    error: McpError,
) -> Value {
    error!(%source, %target, method, "conversion failed: {}", error);

    compliance::error_response(
        id,
        McpError::Conversion {
            source_transport: source.to_string(),
            target_transport: target.to_string(),
            message: String::new(),
        }
        .error_code(),
        &format!("{} to {} conversion failed: {}", source, target, error),
        Some(json!({
            "error_type": "conversion",
            "context": method,
            "source_protocol": source.as_str(),
            "target_protocol": target.as_str(),
        })),
    )
}

/// Frame one JSON-RPC response for the target transport
pub fn format_for_transport(target: TransportKind, response: &Value) -> String {
    match target {
        TransportKind::Sse => format!("data: {}\n\n", response),
        TransportKind::Stdio | TransportKind::StreamableHttp => response.to_string(),
    }
}

/// Clean the `arguments` object inside tools/call params
fn clean_call_params(params: Value) -> Value {
    let Value::Object(mut params) = params else {
        return params;
    };
    if let Some(arguments) = params.remove("arguments") {
        params.insert("arguments".to_string(), clean_tool_arguments(arguments));
    }
    Value::Object(params)
}

/// Drop cursor-style keys whose value is an empty or whitespace-only
/// string, recursing into nested objects.
///
/// Several MCP clients send `"start_cursor": ""` to mean "no cursor", which
/// strict upstreams reject as an invalid cursor value.
pub fn clean_tool_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Object(map) => {
            let mut cleaned = Map::with_capacity(map.len());
            for (key, value) in map {
                if is_cursor_key(&key) && is_blank_string(&value) {
                    debug!(key, "dropping empty cursor argument");
                    continue;
                }
                cleaned.insert(key, clean_tool_arguments(value));
            }
            Value::Object(cleaned)
        }
        other => other,
    }
}

fn is_cursor_key(key: &str) -> bool {
    key.to_ascii_lowercase().contains("cursor")
}

fn is_blank_string(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.trim().is_empty())
}
