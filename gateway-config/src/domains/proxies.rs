//! Outward-facing proxy configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::services::TransportKind;
use super::utils::default_false;
use super::ImportReport;
use crate::error::ConfigResult;
use crate::validation::{validate_identifier, Validatable};

/// Declaration of one externally exposed proxy endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Unique proxy name
    #[serde(default)]
    pub name: String,

    /// Name of the upstream service this proxy fronts
    #[serde(default, alias = "serverName")]
    pub server_name: String,

    /// Path suffix the proxy is mounted at
    #[serde(default)]
    pub endpoint: String,

    /// Transport the proxy speaks outward; may differ from the upstream's
    #[serde(default, alias = "transport_type", alias = "transportType")]
    pub transport: TransportKind,

    /// Tool names to expose; empty means "expose all"
    #[serde(default, alias = "exposedTools")]
    pub exposed_tools: Vec<String>,

    /// Start the proxy when the gateway boots
    #[serde(default = "default_false", alias = "autoStart")]
    pub auto_start: bool,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Instructions advertised to clients; falls back to the upstream's
    /// when empty
    #[serde(default)]
    pub instructions: String,
}

impl Validatable for ProxyConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_identifier(&self.name, "name", self.domain_name())?;
        validate_identifier(&self.server_name, "server_name", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "proxies"
    }
}

impl ProxyConfig {
    /// The endpoint path with any leading/trailing slashes removed
    pub fn endpoint_path(&self) -> &str {
        self.endpoint.trim_matches('/')
    }
}

/// The `mcpProxies` file shape
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxiesFile {
    #[serde(default, alias = "mcpProxies")]
    pub mcp_proxies: BTreeMap<String, ProxyEntry>,
}

/// One raw `mcpProxies` map entry, before the name is attached
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyEntry {
    #[serde(default, alias = "serverName")]
    pub server_name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, alias = "transport_type", alias = "transportType")]
    pub transport: TransportKind,
    #[serde(default, alias = "exposedTools")]
    pub exposed_tools: Vec<String>,
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
}

impl ProxiesFile {
    /// Parse a raw JSON value in the `mcpProxies` shape
    pub fn from_json(value: serde_json::Value) -> ConfigResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Convert every entry into a validated [`ProxyConfig`], skipping and
    /// reporting invalid ones.
    pub fn into_configs(self) -> (Vec<ProxyConfig>, ImportReport) {
        let mut configs = Vec::new();
        let mut report = ImportReport::default();

        for (name, entry) in self.mcp_proxies {
            let config = ProxyConfig {
                name: name.clone(),
                server_name: entry.server_name,
                endpoint: entry.endpoint,
                transport: entry.transport,
                exposed_tools: entry.exposed_tools,
                auto_start: entry.auto_start,
                description: entry.description,
                instructions: entry.instructions,
            };

            match config.validate() {
                Ok(()) => {
                    report.record_success();
                    configs.push(config);
                }
                Err(e) => {
                    warn!(proxy = %name, error = %e, "skipping invalid proxy entry");
                    report.record_failure(name, e);
                }
            }
        }

        (configs, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_proxy_import() {
        let file = ProxiesFile::from_json(json!({
            "mcpProxies": {
                "notion": {
                    "serverName": "notion-upstream",
                    "endpoint": "/notion",
                    "transportType": "sse",
                    "exposedTools": ["get-page"],
                    "autoStart": true
                }
            }
        }))
        .unwrap();

        let (configs, report) = file.into_configs();
        assert_eq!(report.succeeded, 1);
        let proxy = &configs[0];
        assert_eq!(proxy.server_name, "notion-upstream");
        assert_eq!(proxy.endpoint_path(), "notion");
        assert_eq!(proxy.transport, TransportKind::Sse);
        assert_eq!(proxy.exposed_tools, vec!["get-page"]);
    }

    #[test]
    fn test_proxy_requires_server_name() {
        let config = ProxyConfig {
            name: "p".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
