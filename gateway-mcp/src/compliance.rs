//! Validation and normalization of MCP messages against protocol version 2025-03-26
//!
//! Everything here is a pure function over `serde_json::Value`: upstream
//! servers disagree wildly about optional fields, so the gateway repairs
//! messages at the boundary instead of rejecting them. All normalizers are
//! idempotent; every outbound response passes through
//! [`ensure_jsonrpc_response`] exactly once.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Map, Value};

use crate::protocol::{JSONRPC_VERSION, MCP_PROTOCOL_VERSION};

/// Validate an MCP initialize request.
///
/// Required: `protocolVersion: string`, `capabilities: object`,
/// `clientInfo.name: string`.
pub fn validate_initialize_request(request: &Value) -> Result<(), String> {
    let obj = request
        .as_object()
        .ok_or_else(|| "initialize request must be an object".to_string())?;

    match obj.get("protocolVersion") {
        Some(Value::String(_)) => {}
        Some(_) => return Err("protocolVersion must be a string".to_string()),
        None => return Err("Missing required field: protocolVersion".to_string()),
    }

    match obj.get("capabilities") {
        Some(Value::Object(_)) => {}
        Some(_) => return Err("capabilities must be an object".to_string()),
        None => return Err("Missing required field: capabilities".to_string()),
    }

    let client_info = match obj.get("clientInfo") {
        Some(Value::Object(info)) => info,
        Some(_) => return Err("clientInfo must be an object".to_string()),
        None => return Err("Missing required field: clientInfo".to_string()),
    };

    match client_info.get("name") {
        Some(Value::String(_)) => Ok(()),
        _ => Err("clientInfo must contain 'name' field".to_string()),
    }
}

/// Validate an MCP initialize response.
///
/// Required: `protocolVersion`, `capabilities`,
/// `serverInfo.{name,version}`.
pub fn validate_initialize_response(response: &Value) -> Result<(), String> {
    let obj = response
        .as_object()
        .ok_or_else(|| "initialize response must be an object".to_string())?;

    match obj.get("protocolVersion") {
        Some(Value::String(_)) => {}
        Some(_) => return Err("protocolVersion must be a string".to_string()),
        None => return Err("Missing required field: protocolVersion".to_string()),
    }

    match obj.get("capabilities") {
        Some(Value::Object(_)) => {}
        Some(_) => return Err("capabilities must be an object".to_string()),
        None => return Err("Missing required field: capabilities".to_string()),
    }

    let server_info = match obj.get("serverInfo") {
        Some(Value::Object(info)) => info,
        Some(_) => return Err("serverInfo must be an object".to_string()),
        None => return Err("Missing required field: serverInfo".to_string()),
    };

    if !server_info.contains_key("name") {
        return Err("serverInfo must contain 'name' field".to_string());
    }
    if !server_info.contains_key("version") {
        return Err("serverInfo must contain 'version' field".to_string());
    }

    Ok(())
}

/// JSON Schema type names accepted in tool input schemas
const SCHEMA_TYPES: &[&str] = &["object", "array", "string", "number", "integer", "boolean", "null"];

fn validate_input_schema(schema: &Value, path: &str) -> Result<(), String> {
    let obj = schema
        .as_object()
        .ok_or_else(|| format!("{} must be an object", path))?;

    let type_name = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{} must contain a string 'type' field", path))?;

    if !SCHEMA_TYPES.contains(&type_name) {
        return Err(format!("{} has unknown type '{}'", path, type_name));
    }

    if let Some(properties) = obj.get("properties") {
        let props = properties
            .as_object()
            .ok_or_else(|| format!("{}.properties must be an object", path))?;
        for (name, sub_schema) in props {
            validate_input_schema(sub_schema, &format!("{}.properties.{}", path, name))?;
        }
    }

    if let Some(items) = obj.get("items") {
        validate_input_schema(items, &format!("{}.items", path))?;
    }

    Ok(())
}

/// Validate a tool definition: name format, description type, and a
/// recursively well-formed input schema. When `existing` is supplied the
/// name must not collide with an already-registered tool.
pub fn validate_tool(tool: &Value, existing: Option<&[Value]>) -> Result<(), String> {
    let obj = tool.as_object().ok_or_else(|| "tool must be an object".to_string())?;

    let name = match obj.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => return Err("Tool name must be a non-empty string".to_string()),
    };

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(format!(
            "Tool name '{}' must match ^[A-Za-z0-9_-]+$",
            name
        ));
    }

    match obj.get("description") {
        Some(Value::String(_)) => {}
        Some(_) => return Err("Tool description must be a string".to_string()),
        None => return Err("Missing required field: description".to_string()),
    }

    let schema = obj
        .get("inputSchema")
        .ok_or_else(|| "Missing required field: inputSchema".to_string())?;
    validate_input_schema(schema, "inputSchema")?;

    if let Some(existing) = existing {
        let duplicate = existing
            .iter()
            .any(|t| t.get("name").and_then(Value::as_str) == Some(name.as_str()));
        if duplicate {
            return Err(format!("Duplicate tool name: {}", name));
        }
    }

    Ok(())
}

/// Repair an upstream initialize response into the 2025-03-26 shape.
///
/// - defaults `protocolVersion` when missing
/// - `capabilities.logging` becomes an object, never null
/// - `capabilities.tools.listChanged` defaults to true when tools is present
/// - `capabilities.resources` gets boolean `subscribe` / `listChanged`
/// - `instructions` found inside `serverInfo` moves to the top level;
///   `description` inside `serverInfo` is dropped
/// - an empty or whitespace-only top-level `instructions` is dropped
pub fn normalize_initialize_response(raw: Value) -> Value {
    let mut response = match raw {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("raw".to_string(), other);
            map
        }
    };

    if !matches!(response.get("protocolVersion"), Some(Value::String(_))) {
        response.insert(
            "protocolVersion".to_string(),
            Value::String(MCP_PROTOCOL_VERSION.to_string()),
        );
    }

    // Capabilities
    let mut capabilities = match response.remove("capabilities") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    match capabilities.get("logging") {
        Some(Value::Object(_)) => {}
        _ => {
            capabilities.insert("logging".to_string(), Value::Object(Map::new()));
        }
    }

    if let Some(tools) = capabilities.remove("tools") {
        if !tools.is_null() {
            let mut tools = match tools {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            match tools.get("listChanged") {
                Some(Value::Bool(_)) => {}
                _ => {
                    tools.insert("listChanged".to_string(), Value::Bool(true));
                }
            }
            capabilities.insert("tools".to_string(), Value::Object(tools));
        }
    }

    if let Some(resources) = capabilities.remove("resources") {
        if !resources.is_null() {
            let mut resources = match resources {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            if !matches!(resources.get("subscribe"), Some(Value::Bool(_))) {
                resources.insert("subscribe".to_string(), Value::Bool(false));
            }
            if !matches!(resources.get("listChanged"), Some(Value::Bool(_))) {
                resources.insert("listChanged".to_string(), Value::Bool(false));
            }
            capabilities.insert("resources".to_string(), Value::Object(resources));
        }
    }

    response.insert("capabilities".to_string(), Value::Object(capabilities));

    // Server info
    let mut server_info = match response.remove("serverInfo") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    if !server_info.contains_key("name") {
        server_info.insert("name".to_string(), Value::String("Unknown".to_string()));
    }
    if !server_info.contains_key("version") {
        server_info.insert("version".to_string(), Value::String("1.0.0".to_string()));
    }

    // Instructions belong at the top level, never inside serverInfo
    if let Some(instructions) = server_info.remove("instructions") {
        let text = value_to_trimmed_string(&instructions);
        if !text.is_empty() {
            response.insert("instructions".to_string(), Value::String(text));
        }
    }
    server_info.remove("description");

    response.insert("serverInfo".to_string(), Value::Object(server_info));

    // A blank top-level instructions field carries no information
    if let Some(existing) = response.get("instructions").cloned() {
        let text = value_to_trimmed_string(&existing);
        if text.is_empty() {
            response.remove("instructions");
        } else if existing.as_str() != Some(text.as_str()) {
            response.insert("instructions".to_string(), Value::String(text));
        }
    }

    Value::Object(response)
}

fn value_to_trimmed_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

/// Counter backing the placeholder names handed to anonymous tools
static ANONYMOUS_TOOL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Repair a tool definition: missing name, description, or input schema
/// get usable defaults so one malformed tool cannot poison a tool list.
pub fn normalize_tool(tool: Value) -> Value {
    let mut tool = match tool {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    if !matches!(tool.get("name"), Some(Value::String(s)) if !s.trim().is_empty()) {
        let n = ANONYMOUS_TOOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        tool.insert("name".to_string(), Value::String(format!("Tool-{}", n)));
    }

    if !matches!(tool.get("description"), Some(Value::String(_))) {
        tool.insert(
            "description".to_string(),
            Value::String("No description provided".to_string()),
        );
    }

    match tool.get_mut("inputSchema") {
        Some(Value::Object(schema)) => {
            if !matches!(schema.get("type"), Some(Value::String(_))) {
                schema.insert("type".to_string(), Value::String("object".to_string()));
                if !schema.contains_key("properties") {
                    schema.insert("properties".to_string(), Value::Object(Map::new()));
                }
            }
        }
        _ => {
            tool.insert(
                "inputSchema".to_string(),
                json!({"type": "object", "properties": {}}),
            );
        }
    }

    Value::Object(tool)
}

/// Guarantee a well-formed JSON-RPC 2.0 response: `jsonrpc` set, `id` set,
/// and exactly one of `result` / `error` present. A bare value is coerced
/// into `{result: value}`; a malformed error object is replaced by an
/// internal error carrying the stringified original.
pub fn ensure_jsonrpc_response(value: Value, request_id: Option<&Value>) -> Value {
    let mut response = match value {
        Value::Object(map) if map.contains_key("result") || map.contains_key("error") => map,
        bare => {
            let mut map = Map::new();
            map.insert("result".to_string(), bare);
            map
        }
    };

    response.insert(
        "jsonrpc".to_string(),
        Value::String(JSONRPC_VERSION.to_string()),
    );

    if !response.contains_key("id") || response.get("id") == Some(&Value::Null) {
        response.insert(
            "id".to_string(),
            request_id.cloned().unwrap_or(Value::Null),
        );
    }

    // Exactly one of result/error: a present error wins
    if response.contains_key("error") {
        response.remove("result");

        let well_formed = matches!(
            response.get("error"),
            Some(Value::Object(err))
                if matches!(err.get("code"), Some(Value::Number(n)) if n.is_i64())
                    && matches!(err.get("message"), Some(Value::String(_)))
        );

        if !well_formed {
            let original = response.remove("error").unwrap_or(Value::Null);
            response.insert(
                "error".to_string(),
                json!({"code": -32603, "message": stringify_error(&original)}),
            );
        }
    }

    Value::Object(response)
}

fn stringify_error(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build a JSON-RPC error response
pub fn error_response(id: Option<Value>, code: i32, message: &str, data: Option<Value>) -> Value {
    let mut error = Map::new();
    error.insert("code".to_string(), json!(code));
    error.insert("message".to_string(), Value::String(message.to_string()));
    if let Some(data) = data {
        error.insert("data".to_string(), data);
    }

    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.unwrap_or(Value::Null),
        "error": Value::Object(error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_initialize_request() {
        let valid = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "inspector", "version": "0.9.0"}
        });
        assert!(validate_initialize_request(&valid).is_ok());

        let missing_version = json!({"capabilities": {}, "clientInfo": {"name": "x"}});
        assert!(validate_initialize_request(&missing_version)
            .unwrap_err()
            .contains("protocolVersion"));

        let bad_capabilities = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": "none",
            "clientInfo": {"name": "x"}
        });
        assert!(validate_initialize_request(&bad_capabilities).is_err());

        let nameless_client = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {}
        });
        assert!(validate_initialize_request(&nameless_client).is_err());
    }

    #[test]
    fn test_validate_initialize_response() {
        let valid = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"logging": {}},
            "serverInfo": {"name": "X", "version": "1"}
        });
        assert!(validate_initialize_response(&valid).is_ok());

        let missing_version_field = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "serverInfo": {"name": "X"}
        });
        assert!(validate_initialize_response(&missing_version_field)
            .unwrap_err()
            .contains("version"));
    }

    #[test]
    fn test_validate_tool() {
        let valid = json!({
            "name": "get-user",
            "description": "Fetch a user",
            "inputSchema": {
                "type": "object",
                "properties": {"id": {"type": "string"}}
            }
        });
        assert!(validate_tool(&valid, None).is_ok());

        let bad_name = json!({
            "name": "get user!",
            "description": "",
            "inputSchema": {"type": "object"}
        });
        assert!(validate_tool(&bad_name, None).is_err());

        let bad_schema_type = json!({
            "name": "t",
            "description": "",
            "inputSchema": {"type": "tuple"}
        });
        assert!(validate_tool(&bad_schema_type, None).is_err());

        let nested_bad = json!({
            "name": "t",
            "description": "",
            "inputSchema": {
                "type": "object",
                "properties": {"xs": {"type": "array", "items": {"type": "widget"}}}
            }
        });
        assert!(validate_tool(&nested_bad, None).is_err());

        let existing = [json!({"name": "get-user"})];
        assert!(validate_tool(&valid, Some(&existing)).unwrap_err().contains("Duplicate"));
    }

    #[test]
    fn test_normalize_initialize_response_contract() {
        // The literal end-to-end scenario from the protocol: null logging
        // repaired, instructions hoisted out of serverInfo.
        let raw = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"logging": null},
            "serverInfo": {"name": "X", "version": "1", "instructions": "Hello"}
        });

        let normalized = normalize_initialize_response(raw);
        assert_eq!(
            normalized,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"logging": {}},
                "serverInfo": {"name": "X", "version": "1"},
                "instructions": "Hello"
            })
        );
    }

    #[test]
    fn test_normalize_initialize_response_defaults() {
        let normalized = normalize_initialize_response(json!({}));
        assert_eq!(normalized["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(normalized["capabilities"]["logging"], json!({}));
        assert_eq!(normalized["serverInfo"]["name"], "Unknown");
        assert_eq!(normalized["serverInfo"]["version"], "1.0.0");
        assert!(normalized.get("instructions").is_none());
    }

    #[test]
    fn test_normalize_initialize_response_capability_repair() {
        let raw = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {
                "tools": {},
                "resources": {"subscribe": true}
            },
            "serverInfo": {"name": "s", "version": "2", "description": "internal build"}
        });

        let normalized = normalize_initialize_response(raw);
        assert_eq!(normalized["capabilities"]["tools"]["listChanged"], json!(true));
        assert_eq!(normalized["capabilities"]["resources"]["subscribe"], json!(true));
        assert_eq!(normalized["capabilities"]["resources"]["listChanged"], json!(false));
        assert!(normalized["serverInfo"].get("description").is_none());
    }

    #[test]
    fn test_normalize_drops_blank_instructions() {
        let raw = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "serverInfo": {"name": "s", "version": "1"},
            "instructions": "   "
        });
        let normalized = normalize_initialize_response(raw);
        assert!(normalized.get("instructions").is_none());
    }

    #[test]
    fn test_normalize_initialize_response_idempotent() {
        let raw = json!({
            "capabilities": {"logging": null, "tools": {}, "resources": {}},
            "serverInfo": {"instructions": "  use wisely  ", "description": "drop me"}
        });

        let once = normalize_initialize_response(raw);
        let twice = normalize_initialize_response(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once["instructions"], "use wisely");
        // Normalized output always passes validation
        assert!(validate_initialize_response(&once).is_ok());
    }

    #[test]
    fn test_normalize_tool_defaults() {
        let normalized = normalize_tool(json!({}));
        assert!(normalized["name"].as_str().unwrap().starts_with("Tool-"));
        assert_eq!(normalized["description"], "No description provided");
        assert_eq!(normalized["inputSchema"], json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn test_normalize_tool_preserves_valid_fields() {
        let tool = json!({
            "name": "search",
            "description": "Full-text search",
            "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}
        });
        assert_eq!(normalize_tool(tool.clone()), tool);
    }

    #[test]
    fn test_normalize_tool_repairs_typeless_schema() {
        let normalized = normalize_tool(json!({
            "name": "t",
            "description": "d",
            "inputSchema": {"properties": {}}
        }));
        assert_eq!(normalized["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_ensure_jsonrpc_response_bare_value() {
        let response = ensure_jsonrpc_response(json!({"tools": []}), Some(&json!(7)));
        assert_eq!(
            response,
            json!({"jsonrpc": "2.0", "id": 7, "result": {"tools": []}})
        );
    }

    #[test]
    fn test_ensure_jsonrpc_response_scalar() {
        let response = ensure_jsonrpc_response(json!("pong"), Some(&json!("a")));
        assert_eq!(response["result"], "pong");
        assert_eq!(response["id"], "a");
    }

    #[test]
    fn test_ensure_jsonrpc_response_malformed_error() {
        let response = ensure_jsonrpc_response(
            json!({"error": "upstream fell over", "id": 3}),
            None,
        );
        assert_eq!(response["error"]["code"], -32603);
        assert_eq!(response["error"]["message"], "upstream fell over");
        assert_eq!(response["id"], 3);
        assert!(response.get("result").is_none());
    }

    #[test]
    fn test_ensure_jsonrpc_response_error_wins() {
        let response = ensure_jsonrpc_response(
            json!({
                "result": {"ok": true},
                "error": {"code": -32000, "message": "but also failed"},
                "id": 1
            }),
            None,
        );
        assert!(response.get("result").is_none());
        assert_eq!(response["error"]["code"], -32000);
    }

    #[test]
    fn test_ensure_jsonrpc_response_idempotent() {
        let inputs = vec![
            json!({"result": 5, "id": 1}),
            json!("bare"),
            json!({"error": {"code": -32601, "message": "Method not found"}}),
            json!({"error": [1, 2, 3]}),
        ];

        for input in inputs {
            let once = ensure_jsonrpc_response(input, Some(&json!(42)));
            let twice = ensure_jsonrpc_response(once.clone(), Some(&json!(42)));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(Some(json!(9)), -32601, "Method not found", None);
        assert_eq!(
            response,
            json!({
                "jsonrpc": "2.0",
                "id": 9,
                "error": {"code": -32601, "message": "Method not found"}
            })
        );

        let with_data = error_response(None, -32005, "conversion failed", Some(json!({"source_protocol": "stdio"})));
        assert_eq!(with_data["id"], Value::Null);
        assert_eq!(with_data["error"]["data"]["source_protocol"], "stdio");
    }
}
