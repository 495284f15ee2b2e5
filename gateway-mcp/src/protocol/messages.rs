//! MCP message types shared across transports and managers

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// === Initialize Protocol ===

/// Parameters for the initialize method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol version offered by the client
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    /// Client capabilities (opaque to the gateway)
    pub capabilities: Value,

    /// Client information
    #[serde(rename = "clientInfo", skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// Result of the initialize method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol version
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    /// Server capabilities
    pub capabilities: ServerCapabilities,

    /// Server information
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,

    /// Usage instructions; always top-level, never inside serverInfo
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Client information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name
    pub name: String,

    /// Client version
    #[serde(default)]
    pub version: String,

    /// Additional client metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

/// Server identity captured from an initialize response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name
    pub name: String,

    /// Server version
    #[serde(default)]
    pub version: String,

    /// Instructions the upstream advertised. Held here for inheritance
    /// lookups; never serialized back into serverInfo.
    #[serde(skip)]
    pub instructions: Option<String>,
}

/// Server capabilities advertised in an initialize result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

impl ServerCapabilities {
    /// The capability set the gateway itself advertises to clients
    pub fn gateway() -> Self {
        Self {
            tools: Some(ToolsCapability { list_changed: Some(true) }),
            resources: Some(ResourcesCapability {
                subscribe: Some(false),
                list_changed: Some(false),
            }),
            logging: Some(Value::Object(Default::default())),
            sampling: Some(Value::Object(Default::default())),
            prompts: None,
            experimental: None,
        }
    }
}

/// Tools capability flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Resources capability flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,

    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

// === Tool Protocol ===

/// Tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name
    pub name: String,

    /// Tool description
    #[serde(default)]
    pub description: String,

    /// Input schema for the tool
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,

    /// Additional tool metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

/// Result of tools/list method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// List of available tools
    pub tools: Vec<Tool>,

    /// Next cursor for pagination
    #[serde(skip_serializing_if = "Option::is_none", rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Parameters for tools/call method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallParams {
    /// Tool name to call
    pub name: String,

    /// Tool arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

// === Methods ===

/// MCP methods the gateway dispatches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpMethod {
    Initialize,
    NotificationsInitialized,
    Ping,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesTemplatesList,
    Other(String),
}

impl McpMethod {
    pub fn parse(method: &str) -> Self {
        match method {
            "initialize" => McpMethod::Initialize,
            "notifications/initialized" => McpMethod::NotificationsInitialized,
            "ping" => McpMethod::Ping,
            "tools/list" | "list_tools" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            "resources/list" => McpMethod::ResourcesList,
            "resources/templates/list" => McpMethod::ResourcesTemplatesList,
            other => McpMethod::Other(other.to_string()),
        }
    }

    /// Whether this method must be answered with an empty list instead of
    /// "method not found" when the upstream does not implement it
    pub fn has_empty_list_fallback(&self) -> bool {
        matches!(self, McpMethod::ResourcesList | McpMethod::ResourcesTemplatesList)
    }

    /// The empty-list result body for the fallback methods
    pub fn empty_list_result(&self) -> Option<Value> {
        match self {
            McpMethod::ResourcesList => Some(serde_json::json!({"resources": []})),
            McpMethod::ResourcesTemplatesList => Some(serde_json::json!({"resourceTemplates": []})),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialize_result_serialization() {
        let result = InitializeResult {
            protocol_version: crate::protocol::MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::gateway(),
            server_info: ServerInfo {
                name: "gateway".to_string(),
                version: "1.0.0".to_string(),
                instructions: Some("hidden".to_string()),
            },
            instructions: Some("Use the tools listed by tools/list".to_string()),
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["protocolVersion"], "2025-03-26");
        assert_eq!(value["capabilities"]["tools"]["listChanged"], json!(true));
        assert_eq!(value["capabilities"]["resources"]["subscribe"], json!(false));
        assert_eq!(value["capabilities"]["logging"], json!({}));
        // instructions live at the top level only
        assert!(value["serverInfo"].get("instructions").is_none());
        assert_eq!(value["instructions"], "Use the tools listed by tools/list");
    }

    #[test]
    fn test_tool_round_trip() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "get-user",
            "description": "Fetch a user",
            "inputSchema": {"type": "object", "properties": {}},
            "annotations": {"readOnlyHint": true}
        }))
        .unwrap();

        assert_eq!(tool.name, "get-user");
        assert!(tool.metadata.contains_key("annotations"));

        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(McpMethod::parse("tools/list"), McpMethod::ToolsList);
        assert_eq!(McpMethod::parse("list_tools"), McpMethod::ToolsList);
        assert_eq!(McpMethod::parse("resources/list"), McpMethod::ResourcesList);
        assert!(McpMethod::parse("resources/list").has_empty_list_fallback());
        assert!(!McpMethod::parse("tools/call").has_empty_list_fallback());
        assert_eq!(
            McpMethod::parse("resources/templates/list").empty_list_result(),
            Some(json!({"resourceTemplates": []}))
        );
    }
}
