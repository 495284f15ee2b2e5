//! Upstream service lifecycle and dispatch
//!
//! The service manager owns every configured upstream: its status machine,
//! its verified tool list and server identity, and a uniform
//! `call(name, method, params)` that opens a transient session over the
//! right transport adapter, dispatches, and tears the session down.

pub mod retry;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use gateway_config::{ImportReport, ServiceConfig, ServicesFile, TransportKind};

use crate::convert::clean_tool_arguments;
use crate::error::{McpError, McpResult};
use crate::protocol::ServerInfo;
use crate::transport;
use self::retry::{retry_with_backoff, RetryPolicy};

/// Runtime status of one upstream service
///
/// stdio services report `stopped | running | error`; remote services
/// report `stopped | connected | disconnected | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Running,
    Connected,
    Disconnected,
    Error,
}

impl ServiceStatus {
    /// Parse a stored status string. The legacy `verified` value is
    /// coalesced to `running` on read.
    pub fn parse(value: &str) -> Self {
        match value {
            "running" | "verified" => ServiceStatus::Running,
            "connected" => ServiceStatus::Connected,
            "disconnected" => ServiceStatus::Disconnected,
            "error" => ServiceStatus::Error,
            _ => ServiceStatus::Stopped,
        }
    }

    /// Whether a proxy may attach to a service in this status
    pub fn is_available(&self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Running => "running",
            ServiceStatus::Connected => "connected",
            ServiceStatus::Disconnected => "disconnected",
            ServiceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime state of one upstream service
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub config: ServiceConfig,
    pub status: ServiceStatus,
    pub tools: Vec<Value>,
    pub server_info: Option<ServerInfo>,
    pub initialization_result: Option<Value>,
    pub error_message: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            status: ServiceStatus::Stopped,
            tools: Vec::new(),
            server_info: None,
            initialization_result: None,
            error_message: None,
            last_error_time: None,
            start_time: None,
        }
    }
}

/// Status record handed to monitoring surfaces
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub transport: TransportKind,
    pub status: ServiceStatus,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Owner of every configured upstream service
pub struct ServiceManager {
    services: RwLock<HashMap<String, ServiceInstance>>,
    retry_policy: RetryPolicy,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Build a manager preloaded with parsed service configurations
    pub async fn with_configs(configs: Vec<ServiceConfig>) -> Self {
        let manager = Self::new();
        for config in configs {
            if let Err(e) = manager.add(config).await {
                warn!("skipping service: {}", e);
            }
        }
        manager
    }

    /// Register a new service in `stopped` state
    pub async fn add(&self, config: ServiceConfig) -> McpResult<()> {
        use gateway_config::validation::Validatable;
        config.validate()?;

        let mut services = self.services.write().await;
        if services.contains_key(&config.name) {
            return Err(McpError::Configuration {
                message: format!("service '{}' already exists", config.name),
            });
        }

        info!(service = %config.name, transport = %config.transport, "service added");
        services.insert(config.name.clone(), ServiceInstance::new(config));
        Ok(())
    }

    /// Remove a service and its runtime state
    pub async fn remove(&self, name: &str) -> McpResult<()> {
        let mut services = self.services.write().await;
        services
            .remove(name)
            .map(|_| info!(service = name, "service removed"))
            .ok_or_else(|| McpError::ServiceNotFound { name: name.to_string() })
    }

    /// Replace a service's configuration; the instance is re-verified iff
    /// it was previously available.
    pub async fn update(&self, old_name: &str, config: ServiceConfig) -> McpResult<()> {
        use gateway_config::validation::Validatable;
        config.validate()?;

        let was_available = {
            let mut services = self.services.write().await;
            let instance = services
                .remove(old_name)
                .ok_or_else(|| McpError::ServiceNotFound { name: old_name.to_string() })?;

            if config.name != old_name && services.contains_key(&config.name) {
                // Roll back before failing
                services.insert(old_name.to_string(), instance);
                return Err(McpError::Configuration {
                    message: format!("service '{}' already exists", config.name),
                });
            }

            let was_available = instance.status.is_available();
            services.insert(config.name.clone(), ServiceInstance::new(config.clone()));
            was_available
        };

        info!(service = %config.name, "service updated");
        if was_available {
            self.verify(&config.name).await?;
        }
        Ok(())
    }

    /// Mark a service as started. Stdio children are spawned lazily by the
    /// next call; for remote transports this only flips the status.
    pub async fn start(&self, name: &str) -> McpResult<()> {
        let mut services = self.services.write().await;
        let instance = services
            .get_mut(name)
            .ok_or_else(|| McpError::ServiceNotFound { name: name.to_string() })?;

        instance.status = ServiceStatus::Running;
        instance.start_time = Some(Utc::now());
        instance.error_message = None;
        info!(service = name, "service started");
        Ok(())
    }

    /// Stop a service: status returns to `stopped` and the cached tool
    /// list is dropped. In-flight transient sessions own their child
    /// processes and tear them down when the call finishes.
    pub async fn stop(&self, name: &str) -> McpResult<()> {
        let mut services = self.services.write().await;
        let instance = services
            .get_mut(name)
            .ok_or_else(|| McpError::ServiceNotFound { name: name.to_string() })?;

        instance.status = ServiceStatus::Stopped;
        instance.tools.clear();
        instance.start_time = None;
        info!(service = name, "service stopped");
        Ok(())
    }

    /// Verify connectivity: open a transient session, initialize, capture
    /// the server identity, list and normalize the tools, then tear the
    /// session down. Retries with exponential backoff before giving up.
    pub async fn verify(&self, name: &str) -> McpResult<Vec<Value>> {
        let config = self.config(name).await.ok_or_else(|| McpError::ServiceNotFound {
            name: name.to_string(),
        })?;

        let outcome = retry_with_backoff(&self.retry_policy, "verify", || async {
            let mut session = transport::open(&config).await?;
            let result = async {
                let init_result = session.initialize().await?;
                let tools = session.list_tools().await?;
                Ok::<_, McpError>((init_result, tools))
            }
            .await;
            if let Err(e) = session.close().await {
                debug!(service = %config.name, "verification session close failed: {}", e);
            }
            result
        })
        .await;

        let mut services = self.services.write().await;
        let instance = services
            .get_mut(name)
            .ok_or_else(|| McpError::ServiceNotFound { name: name.to_string() })?;

        match outcome {
            Ok((init_result, tools)) => {
                instance.server_info = Some(extract_server_info(&init_result));
                instance.initialization_result = Some(init_result);
                instance.tools = tools.clone();
                instance.status = if config.transport.is_remote() {
                    ServiceStatus::Connected
                } else {
                    ServiceStatus::Running
                };
                instance.error_message = None;
                if instance.start_time.is_none() {
                    instance.start_time = Some(Utc::now());
                }
                info!(service = name, tools = tools.len(), "service verified");
                Ok(tools)
            }
            Err(e) => {
                instance.status = if config.transport.is_remote() {
                    ServiceStatus::Disconnected
                } else {
                    ServiceStatus::Error
                };
                instance.error_message = Some(e.to_string());
                instance.last_error_time = Some(Utc::now());
                warn!(service = name, "verification failed: {}", e);
                Err(e)
            }
        }
    }

    /// Dispatch one method on a transient session to the named service.
    ///
    /// `tools/call` arguments are cleaned before forwarding, and the
    /// resources listing methods degrade to empty lists when the upstream
    /// does not implement them.
    pub async fn call(&self, name: &str, method: &str, params: Option<Value>) -> McpResult<Value> {
        let config = self.config(name).await.ok_or_else(|| McpError::ServiceNotFound {
            name: name.to_string(),
        })?;

        let params = if method == "tools/call" {
            params.map(|p| match p {
                Value::Object(mut map) => {
                    if let Some(arguments) = map.remove("arguments") {
                        map.insert("arguments".to_string(), clean_tool_arguments(arguments));
                    }
                    Value::Object(map)
                }
                other => other,
            })
        } else {
            params
        };

        let mut session = transport::open(&config).await?;
        let result = async {
            session.initialize().await?;
            if method == "tools/list" {
                let tools = session.list_tools().await?;
                return Ok(serde_json::json!({ "tools": tools }));
            }
            session.call(method, params).await
        }
        .await;

        if let Err(e) = session.close().await {
            debug!(service = name, "session close failed: {}", e);
        }

        if let Err(e) = &result {
            let mut services = self.services.write().await;
            if let Some(instance) = services.get_mut(name) {
                instance.error_message = Some(e.to_string());
                instance.last_error_time = Some(Utc::now());
            }
        }

        result
    }

    /// Import services from a raw `mcpServers` JSON value. Entries using
    /// camelCase keys, joined argument strings, or machine-local
    /// executable paths are normalized on the way in.
    pub async fn import_config(&self, config_json: Value) -> McpResult<ImportReport> {
        let file = ServicesFile::from_json(config_json)?;
        let (configs, mut report) = file.into_configs();

        // Entries that parsed but collide with existing names are failures
        // too; the batch itself never aborts.
        for config in configs {
            let name = config.name.clone();
            if let Err(e) = self.add(config).await {
                report.succeeded -= 1;
                report.record_failure(name, e);
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "service import finished"
        );
        Ok(report)
    }

    /// Snapshot one service for monitoring
    pub async fn status(&self, name: &str) -> Option<ServiceSnapshot> {
        let services = self.services.read().await;
        services.get(name).map(snapshot)
    }

    /// Snapshot every service, sorted by name
    pub async fn statuses(&self) -> Vec<ServiceSnapshot> {
        let services = self.services.read().await;
        let mut snapshots: Vec<_> = services.values().map(snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// The service's parsed configuration
    pub async fn config(&self, name: &str) -> Option<ServiceConfig> {
        let services = self.services.read().await;
        services.get(name).map(|i| i.config.clone())
    }

    /// Current status of the named service
    pub async fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        let services = self.services.read().await;
        services.get(name).map(|i| i.status)
    }

    /// The verified tool list, if any
    pub async fn tools(&self, name: &str) -> Option<Vec<Value>> {
        let services = self.services.read().await;
        services.get(name).map(|i| i.tools.clone())
    }

    /// Server identity captured at verification time
    pub async fn server_info(&self, name: &str) -> Option<ServerInfo> {
        let services = self.services.read().await;
        services.get(name).and_then(|i| i.server_info.clone())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.services.read().await.contains_key(name)
    }

    /// Names of all registered services
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Direct access to the instance map for crate-internal tests
    #[cfg(test)]
    pub(crate) fn services_for_tests(&self) -> &RwLock<HashMap<String, ServiceInstance>> {
        &self.services
    }

    /// Start (and verify) every service configured with auto_start
    pub async fn auto_start_all(&self) {
        let names: Vec<String> = {
            let services = self.services.read().await;
            services
                .values()
                .filter(|i| i.config.auto_start)
                .map(|i| i.config.name.clone())
                .collect()
        };

        for name in names {
            if let Err(e) = self.start(&name).await {
                warn!(service = %name, "auto-start failed: {}", e);
                continue;
            }
            if let Err(e) = self.verify(&name).await {
                warn!(service = %name, "auto-start verification failed: {}", e);
            }
        }
    }
}

fn snapshot(instance: &ServiceInstance) -> ServiceSnapshot {
    ServiceSnapshot {
        name: instance.config.name.clone(),
        transport: instance.config.transport,
        status: instance.status,
        tool_count: instance.tools.len(),
        server_info: instance.server_info.clone(),
        error_message: instance.error_message.clone(),
        start_time: instance.start_time,
        last_error_time: instance.last_error_time,
    }
}

/// Pull `{name, version}` plus the top-level instructions out of a
/// normalized initialize result
fn extract_server_info(init_result: &Value) -> ServerInfo {
    let server_info = init_result.get("serverInfo");
    ServerInfo {
        name: server_info
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        version: server_info
            .and_then(|v| v.get("version"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        instructions: init_result
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn stdio_config(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            command: "cat".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_remove() {
        let manager = ServiceManager::new();
        manager.add(stdio_config("files")).await.unwrap();
        assert!(manager.contains("files").await);

        // Duplicate names are rejected
        assert!(manager.add(stdio_config("files")).await.is_err());

        manager.remove("files").await.unwrap();
        assert!(!manager.contains("files").await);
        assert!(manager.remove("files").await.is_err());
    }

    #[tokio::test]
    async fn test_add_validates_config() {
        let manager = ServiceManager::new();
        let invalid = ServiceConfig {
            name: "broken".to_string(),
            ..Default::default()
        };
        assert!(manager.add(invalid).await.is_err());
    }

    #[tokio::test]
    async fn test_start_stop_status_machine() {
        let manager = ServiceManager::new();
        manager.add(stdio_config("svc")).await.unwrap();
        assert_eq!(manager.service_status("svc").await, Some(ServiceStatus::Stopped));

        manager.start("svc").await.unwrap();
        assert_eq!(manager.service_status("svc").await, Some(ServiceStatus::Running));

        manager.stop("svc").await.unwrap();
        assert_eq!(manager.service_status("svc").await, Some(ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn test_legacy_verified_coalesces_to_running() {
        assert_eq!(ServiceStatus::parse("verified"), ServiceStatus::Running);
        assert_eq!(ServiceStatus::parse("connected"), ServiceStatus::Connected);
        assert_eq!(ServiceStatus::parse("unknown"), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_update_rejects_name_collision() {
        let manager = ServiceManager::new();
        manager.add(stdio_config("a")).await.unwrap();
        manager.add(stdio_config("b")).await.unwrap();

        let renamed = stdio_config("b");
        assert!(manager.update("a", renamed).await.is_err());
        // The original entry survives the failed update
        assert!(manager.contains("a").await);
    }

    #[tokio::test]
    async fn test_import_config() {
        let manager = ServiceManager::new();
        let report = manager
            .import_config(json!({
                "mcpServers": {
                    "files": {"command": "/usr/local/bin/npx", "args": "-y server-filesystem"},
                    "broken": {"transportType": "sse"}
                }
            }))
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 1);

        let config = manager.config("files").await.unwrap();
        assert_eq!(config.command, "npx");
        assert_eq!(config.args, vec!["-y", "server-filesystem"]);
    }

    #[tokio::test]
    async fn test_import_counts_duplicates_as_failures() {
        let manager = ServiceManager::new();
        manager.add(stdio_config("files")).await.unwrap();

        let report = manager
            .import_config(json!({"mcpServers": {"files": {"command": "npx"}}}))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_call_unknown_service() {
        let manager = ServiceManager::new();
        assert!(matches!(
            manager.call("ghost", "tools/list", None).await,
            Err(McpError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_failure_sets_error_status() {
        let manager = ServiceManager {
            services: RwLock::new(HashMap::new()),
            retry_policy: RetryPolicy {
                max_retries: 0,
                initial_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
            },
        };
        let config = ServiceConfig {
            name: "ghost".to_string(),
            command: "definitely-not-a-real-binary-7f3a".to_string(),
            ..Default::default()
        };
        manager.add(config).await.unwrap();

        assert!(manager.verify("ghost").await.is_err());
        let snapshot = manager.status("ghost").await.unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Error);
        assert!(snapshot.error_message.is_some());
        assert!(snapshot.last_error_time.is_some());
    }

    #[tokio::test]
    async fn test_extract_server_info_reads_top_level_instructions() {
        let info = extract_server_info(&json!({
            "serverInfo": {"name": "X", "version": "2"},
            "instructions": "Hello"
        }));
        assert_eq!(info.name, "X");
        assert_eq!(info.version, "2");
        assert_eq!(info.instructions.as_deref(), Some("Hello"));
    }
}
