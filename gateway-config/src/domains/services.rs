//! Upstream MCP service configuration

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::utils::{default_false, deserialize_args};
use super::ImportReport;
use crate::error::ConfigResult;
use crate::validation::{validate_http_url, validate_identifier, validate_required_string, Validatable};

/// Transport an MCP endpoint is spoken over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over a child process's standard streams
    #[default]
    #[serde(rename = "stdio")]
    Stdio,

    /// Server-Sent Events with a paired HTTP message endpoint
    #[serde(rename = "sse")]
    Sse,

    /// Streamable HTTP (JSON frames over a long-lived connection)
    #[serde(rename = "streamable_http", alias = "streamableHTTP", alias = "streamable-http")]
    StreamableHttp,
}

impl TransportKind {
    /// Whether the endpoint is reached over the network rather than a
    /// locally spawned process
    pub fn is_remote(&self) -> bool {
        !matches!(self, TransportKind::Stdio)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable_http",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one upstream MCP service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique, stable service name
    #[serde(default)]
    pub name: String,

    /// Transport the upstream speaks
    #[serde(default, alias = "transport_type", alias = "transportType")]
    pub transport: TransportKind,

    /// Command to execute (stdio only)
    #[serde(default)]
    pub command: String,

    /// Command arguments (stdio only)
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<String>,

    /// Environment variables for the child process (stdio only)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child process (stdio only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Endpoint URL (sse / streamable_http only)
    #[serde(default)]
    pub url: String,

    /// HTTP headers forwarded verbatim to the upstream (sse / streamable_http only)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Start (and verify) the service when the gateway boots
    #[serde(default = "default_false", alias = "autoStart")]
    pub auto_start: bool,

    /// Free-text usage instructions advertised to clients
    #[serde(default)]
    pub instructions: String,
}

impl Validatable for ServiceConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_identifier(&self.name, "name", self.domain_name())?;

        // Exactly one of command/url, matching the transport class
        match self.transport {
            TransportKind::Stdio => {
                validate_required_string(&self.command, "command", self.domain_name())?;
                if !self.url.trim().is_empty() {
                    return Err(self.validation_error(format!(
                        "service '{}' uses stdio transport but sets a url",
                        self.name
                    )));
                }
            }
            TransportKind::Sse | TransportKind::StreamableHttp => {
                validate_http_url(&self.url, "url", self.domain_name())?;
                if !self.command.trim().is_empty() {
                    return Err(self.validation_error(format!(
                        "service '{}' uses {} transport but sets a command",
                        self.name, self.transport
                    )));
                }
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "services"
    }
}

impl ServiceConfig {
    /// Replace machine-local absolute paths of well-known executables with
    /// their bare basenames so configurations move between machines.
    pub fn normalize_paths(&mut self) {
        self.command = normalize_command_path(&self.command);
    }

    /// Check `$VAR` / `${VAR}` references in the env map against the
    /// process environment. Returns a warning message when something is
    /// unresolved; never a hard failure.
    pub fn unresolved_env_references(&self) -> Option<String> {
        let mut missing = Vec::new();

        for (key, value) in &self.env {
            if let Some(reference) = value.strip_prefix('$') {
                let var = reference.trim_start_matches('{').trim_end_matches('}');
                if std::env::var(var).is_err() {
                    missing.push(format!("{}=${}", key, var));
                }
            }
        }

        if missing.is_empty() {
            None
        } else {
            Some(format!(
                "service {} references unset environment variables: {}",
                self.name,
                missing.join(", ")
            ))
        }
    }
}

/// Well-known executables whose absolute paths are machine-local noise
const PORTABLE_EXECUTABLES: &[&str] = &["npx", "node", "python", "python3", "uv", "pip", "pip3"];

/// Reduce an absolute path to its basename when the basename is a
/// well-known executable resolvable from PATH on any machine.
pub fn normalize_command_path(command: &str) -> String {
    if command.is_empty() {
        return String::new();
    }

    let path = Path::new(command);
    if path.is_absolute() {
        if let Some(basename) = path.file_name().and_then(|n| n.to_str()) {
            if PORTABLE_EXECUTABLES.contains(&basename) {
                info!(command, basename, "normalized absolute executable path");
                return basename.to_string();
            }
        }
        warn!(command, "absolute path may not resolve on other machines");
    }

    command.to_string()
}

/// The standard `mcpServers` file shape shared by MCP hosts
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesFile {
    #[serde(default, alias = "mcpServers")]
    pub mcp_servers: BTreeMap<String, ServiceEntry>,
}

/// One raw `mcpServers` map entry, before the name is attached
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceEntry {
    #[serde(default, alias = "transport_type", alias = "transportType")]
    pub transport: TransportKind,
    #[serde(default)]
    pub command: String,
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub description: String,
}

impl ServiceEntry {
    fn into_config(self, name: String) -> ServiceConfig {
        // `instructions` wins; older exports only carried `description`
        let instructions = if self.instructions.trim().is_empty() {
            self.description
        } else {
            self.instructions
        };

        let mut config = ServiceConfig {
            name,
            transport: self.transport,
            command: self.command,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            url: self.url,
            headers: self.headers,
            auto_start: self.auto_start,
            instructions,
        };
        config.normalize_paths();
        config
    }
}

impl ServicesFile {
    /// Parse a raw JSON value in the `mcpServers` shape
    pub fn from_json(value: serde_json::Value) -> ConfigResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Convert every entry into a validated [`ServiceConfig`].
    ///
    /// Invalid entries are reported and skipped; the batch never aborts.
    pub fn into_configs(self) -> (Vec<ServiceConfig>, ImportReport) {
        let mut configs = Vec::new();
        let mut report = ImportReport::default();

        for (name, entry) in self.mcp_servers {
            let config = entry.into_config(name.clone());
            match config.validate() {
                Ok(()) => {
                    if let Some(warning) = config.unresolved_env_references() {
                        warn!("{}", warning);
                    }
                    report.record_success();
                    configs.push(config);
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "skipping invalid service entry");
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
    fn test_transport_kind_aliases() {
        let kind: TransportKind = serde_json::from_value(json!("streamableHTTP")).unwrap();
        assert_eq!(kind, TransportKind::StreamableHttp);

        let kind: TransportKind = serde_json::from_value(json!("streamable_http")).unwrap();
        assert_eq!(kind, TransportKind::StreamableHttp);

        let kind: TransportKind = serde_json::from_value(json!("sse")).unwrap();
        assert!(kind.is_remote());
    }

    #[test]
    fn test_service_config_validation() {
        let mut config = ServiceConfig {
            name: "files".to_string(),
            command: "npx".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        // stdio with a url is contradictory
        config.url = "https://example.com".to_string();
        assert!(config.validate().is_err());

        // remote transport requires a url, forbids a command
        let remote = ServiceConfig {
            name: "notion".to_string(),
            transport: TransportKind::Sse,
            url: "https://mcp.example.com/sse".to_string(),
            ..Default::default()
        };
        assert!(remote.validate().is_ok());
    }

    #[test]
    fn test_normalize_command_path() {
        assert_eq!(normalize_command_path("/usr/local/bin/npx"), "npx");
        assert_eq!(normalize_command_path("/opt/homebrew/bin/python3"), "python3");
        assert_eq!(normalize_command_path("npx"), "npx");
        // Unknown executables keep their absolute path
        assert_eq!(normalize_command_path("/opt/custom/mcp-server"), "/opt/custom/mcp-server");
    }

    #[test]
    fn test_import_accepts_both_key_spellings() {
        let file = ServicesFile::from_json(json!({
            "mcpServers": {
                "files": {
                    "command": "/usr/local/bin/npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem"],
                    "autoStart": true
                },
                "notion": {
                    "transportType": "sse",
                    "url": "https://mcp.example.com/sse",
                    "description": "Notion workspace access"
                }
            }
        }))
        .unwrap();

        let (configs, report) = file.into_configs();
        assert_eq!(report.succeeded, 2);
        assert!(report.failed.is_empty());

        let files = configs.iter().find(|c| c.name == "files").unwrap();
        assert_eq!(files.command, "npx");
        assert!(files.auto_start);

        let notion = configs.iter().find(|c| c.name == "notion").unwrap();
        assert_eq!(notion.transport, TransportKind::Sse);
        // description backfills empty instructions
        assert_eq!(notion.instructions, "Notion workspace access");
    }

    #[test]
    fn test_import_skips_invalid_entries() {
        let file = ServicesFile::from_json(json!({
            "mcpServers": {
                "good": {"command": "npx"},
                "bad": {"transport_type": "sse"}
            }
        }))
        .unwrap();

        let (configs, report) = file.into_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
    }
}
