//! Proxy management: filtered tool exposure over configured upstreams
//!
//! A proxy is a named outward-facing endpoint backed by one service. It
//! keeps a filtered copy of the upstream's tool list, inherits
//! instructions, and dispatches client requests through the service
//! manager. Proxies refer to services by name only, so the two managers
//! can be locked independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use gateway_config::{ImportReport, ProxiesFile, ProxyConfig};

use crate::compliance;
use crate::error::{McpError, McpResult};
use crate::protocol::{
    negotiate_protocol_version, InitializeResult, McpMethod, ServerCapabilities, ServerInfo,
};
use crate::service::ServiceManager;

/// Attempts made by the delayed tool-update task before giving up
const DELAYED_UPDATE_RETRIES: u32 = 5;

/// Pause between delayed tool-update attempts
const DELAYED_UPDATE_INTERVAL: Duration = Duration::from_secs(2);

/// Runtime status of one proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

/// Runtime state of one proxy
#[derive(Debug, Clone)]
pub struct ProxyInstance {
    pub config: ProxyConfig,
    pub status: ProxyStatus,
    pub tools: Vec<Value>,
    pub error_message: Option<String>,
}

impl ProxyInstance {
    fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            status: ProxyStatus::Stopped,
            tools: Vec::new(),
            error_message: None,
        }
    }
}

/// Status record handed to monitoring surfaces
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    pub server_name: String,
    pub endpoint: String,
    pub status: ProxyStatus,
    pub tool_count: usize,
    pub exposed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Configuration collaborator that persists proxy declarations. The core
/// never touches files; the host decides where configs live.
pub trait ProxyConfigStore: Send + Sync {
    fn save(&self, configs: &[ProxyConfig]);
}

/// Owner of every configured proxy
pub struct ProxyManager {
    proxies: RwLock<HashMap<String, ProxyInstance>>,
    services: Arc<ServiceManager>,

    /// Serializes tool updates per proxy; updates on different proxies
    /// proceed in parallel
    update_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    store: RwLock<Option<Arc<dyn ProxyConfigStore>>>,
}

impl ProxyManager {
    pub fn new(services: Arc<ServiceManager>) -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
            services,
            update_locks: Mutex::new(HashMap::new()),
            store: RwLock::new(None),
        }
    }

    /// Build a manager preloaded with parsed proxy configurations
    pub async fn with_configs(services: Arc<ServiceManager>, configs: Vec<ProxyConfig>) -> Self {
        let manager = Self::new(services);
        for config in configs {
            if let Err(e) = manager.add(config).await {
                warn!("skipping proxy: {}", e);
            }
        }
        manager
    }

    /// Attach the persistence collaborator
    pub async fn set_store(&self, store: Arc<dyn ProxyConfigStore>) {
        *self.store.write().await = Some(store);
    }

    async fn persist(&self) {
        let store = self.store.read().await.clone();
        if let Some(store) = store {
            let proxies = self.proxies.read().await;
            let configs: Vec<ProxyConfig> = proxies.values().map(|p| p.config.clone()).collect();
            store.save(&configs);
        }
    }

    /// Register a new proxy in `stopped` state
    pub async fn add(&self, config: ProxyConfig) -> McpResult<()> {
        use gateway_config::validation::Validatable;
        config.validate()?;

        {
            let mut proxies = self.proxies.write().await;
            if proxies.contains_key(&config.name) {
                return Err(McpError::Configuration {
                    message: format!("proxy '{}' already exists", config.name),
                });
            }
            info!(proxy = %config.name, upstream = %config.server_name, "proxy added");
            proxies.insert(config.name.clone(), ProxyInstance::new(config));
        }

        self.persist().await;
        Ok(())
    }

    /// Remove a proxy and its runtime state
    pub async fn remove(&self, name: &str) -> McpResult<()> {
        {
            let mut proxies = self.proxies.write().await;
            proxies
                .remove(name)
                .ok_or_else(|| McpError::ProxyNotFound { name: name.to_string() })?;
        }
        self.update_locks.lock().await.remove(name);
        info!(proxy = name, "proxy removed");
        self.persist().await;
        Ok(())
    }

    /// Replace a proxy's configuration; a running proxy is restarted so
    /// the new filter takes effect immediately.
    pub async fn update(&self, old_name: &str, config: ProxyConfig) -> McpResult<()> {
        use gateway_config::validation::Validatable;
        config.validate()?;

        let was_running = {
            let mut proxies = self.proxies.write().await;
            let instance = proxies
                .remove(old_name)
                .ok_or_else(|| McpError::ProxyNotFound { name: old_name.to_string() })?;

            if config.name != old_name && proxies.contains_key(&config.name) {
                proxies.insert(old_name.to_string(), instance);
                return Err(McpError::Configuration {
                    message: format!("proxy '{}' already exists", config.name),
                });
            }

            let was_running = instance.status == ProxyStatus::Running;
            proxies.insert(config.name.clone(), ProxyInstance::new(config.clone()));
            was_running
        };

        info!(proxy = %config.name, "proxy updated");
        self.persist().await;

        if was_running {
            self.start(&config.name).await?;
        }
        Ok(())
    }

    /// Import proxies from a raw `mcpProxies` JSON value
    pub async fn import_config(&self, config_json: Value) -> McpResult<ImportReport> {
        let file = ProxiesFile::from_json(config_json)?;
        let (configs, mut report) = file.into_configs();

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
            "proxy import finished"
        );
        Ok(report)
    }

    /// Start a proxy: requires its upstream to be available, then copies
    /// the filtered tool list and transitions to `running`.
    pub async fn start(&self, name: &str) -> McpResult<()> {
        let server_name = self.server_name_of(name).await?;

        let upstream_status = self.services.service_status(&server_name).await;
        if !upstream_status.map(|s| s.is_available()).unwrap_or(false) {
            let message = format!(
                "upstream service '{}' is not available (status: {})",
                server_name,
                upstream_status.map(|s| s.to_string()).unwrap_or_else(|| "missing".to_string())
            );
            self.mark_error(name, &message).await;
            return Err(McpError::Configuration { message });
        }

        self.update_tools(name).await?;
        info!(proxy = name, "proxy started");
        Ok(())
    }

    /// Stop a proxy: the tool cache is cleared and the status returns to
    /// `stopped`.
    pub async fn stop(&self, name: &str) -> McpResult<()> {
        let mut proxies = self.proxies.write().await;
        let instance = proxies
            .get_mut(name)
            .ok_or_else(|| McpError::ProxyNotFound { name: name.to_string() })?;

        instance.status = ProxyStatus::Stopped;
        instance.tools.clear();
        instance.error_message = None;
        info!(proxy = name, "proxy stopped");
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> McpResult<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Refresh the proxy's tool list from its upstream, applying the
    /// `exposed_tools` filter. Uses the upstream's cached tools when
    /// fresh; otherwise triggers a service verification first.
    pub async fn update_tools(&self, name: &str) -> McpResult<Vec<Value>> {
        let lock = self.update_lock_for(name).await;
        let _guard = lock.lock().await;

        let (server_name, exposed_tools) = {
            let proxies = self.proxies.read().await;
            let instance = proxies
                .get(name)
                .ok_or_else(|| McpError::ProxyNotFound { name: name.to_string() })?;
            (
                instance.config.server_name.clone(),
                instance.config.exposed_tools.clone(),
            )
        };

        if !self.services.contains(&server_name).await {
            let message = format!("upstream service '{}' does not exist", server_name);
            self.mark_error(name, &message).await;
            return Err(McpError::ServiceNotFound { name: server_name });
        }

        // Prefer the upstream's cached tools; fall back to a verification
        let upstream_available = self
            .services
            .service_status(&server_name)
            .await
            .map(|s| s.is_available())
            .unwrap_or(false);
        let cached = self.services.tools(&server_name).await.unwrap_or_default();

        let tools = if upstream_available && !cached.is_empty() {
            debug!(proxy = name, upstream = %server_name, "using cached upstream tools");
            cached
        } else {
            match self.services.verify(&server_name).await {
                Ok(tools) => tools,
                Err(e) => {
                    let message = format!("upstream service '{}' verification failed: {}", server_name, e);
                    self.mark_error(name, &message).await;
                    return Err(e);
                }
            }
        };

        if tools.is_empty() {
            let message = format!("upstream service '{}' has no tool list", server_name);
            self.mark_error(name, &message).await;
            return Err(McpError::Configuration { message });
        }

        let filtered = filter_tools(tools, &exposed_tools);

        let mut proxies = self.proxies.write().await;
        let instance = proxies
            .get_mut(name)
            .ok_or_else(|| McpError::ProxyNotFound { name: name.to_string() })?;
        instance.tools = filtered.clone();
        instance.status = ProxyStatus::Running;
        instance.error_message = None;
        info!(proxy = name, tools = filtered.len(), "proxy tool list updated");

        Ok(filtered)
    }

    /// During startup, bring every auto-start proxy up. Proxies whose
    /// upstream is not ready yet get a delayed update task that retries on
    /// an interval instead of failing the boot.
    pub async fn auto_start_all(self: &Arc<Self>) {
        let candidates: Vec<String> = {
            let proxies = self.proxies.read().await;
            proxies
                .values()
                .filter(|p| p.config.auto_start)
                .map(|p| p.config.name.clone())
                .collect()
        };

        for name in candidates {
            match self.start(&name).await {
                Ok(()) => {}
                Err(e) => {
                    debug!(proxy = %name, "deferring tool update: {}", e);
                    self.spawn_delayed_tool_update(name);
                }
            }
        }
    }

    fn spawn_delayed_tool_update(self: &Arc<Self>, name: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            for attempt in 1..=DELAYED_UPDATE_RETRIES {
                tokio::time::sleep(DELAYED_UPDATE_INTERVAL).await;
                match manager.start(&name).await {
                    Ok(()) => {
                        info!(proxy = %name, attempt, "delayed tool update succeeded");
                        return;
                    }
                    Err(e) => {
                        debug!(proxy = %name, attempt, "delayed tool update failed: {}", e);
                    }
                }
            }
            warn!(
                proxy = %name,
                attempts = DELAYED_UPDATE_RETRIES,
                "giving up on delayed tool update"
            );
        });
    }

    /// Dispatch one JSON-RPC request on behalf of a proxy. Always returns
    /// a well-formed JSON-RPC response value.
    pub async fn proxy_request(&self, name: &str, request: &Value) -> Value {
        let id = request.get("id").cloned();
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = request.get("params").cloned();

        let instance = {
            let proxies = self.proxies.read().await;
            proxies.get(name).cloned()
        };
        let Some(instance) = instance else {
            let e = McpError::ProxyNotFound { name: name.to_string() };
            return compliance::error_response(id, e.error_code(), &e.client_message(), None);
        };

        match McpMethod::parse(&method) {
            McpMethod::Initialize => self.initialize_response(&instance, id, params.as_ref()).await,
            McpMethod::Ping => compliance::ensure_jsonrpc_response(json!({"result": {}}), id.as_ref()),
            McpMethod::ToolsList => compliance::ensure_jsonrpc_response(
                json!({"result": {"tools": instance.tools}}),
                id.as_ref(),
            ),
            // Always answered locally so resource-probing clients work
            // against tool-only upstreams
            McpMethod::ResourcesList | McpMethod::ResourcesTemplatesList => {
                let result = McpMethod::parse(&method).empty_list_result().unwrap_or(Value::Null);
                compliance::ensure_jsonrpc_response(json!({ "result": result }), id.as_ref())
            }
            parsed => {
                if let Some(denied) = self.apply_tool_filter(&instance, &parsed, &method, params.as_ref()) {
                    return compliance::error_response(id, -32601, &denied, None);
                }

                match self
                    .services
                    .call(&instance.config.server_name, &method, params)
                    .await
                {
                    Ok(result) => {
                        compliance::ensure_jsonrpc_response(json!({ "result": result }), id.as_ref())
                    }
                    Err(e) => compliance::error_response(
                        id,
                        e.error_code(),
                        &e.client_message(),
                        Some(json!({"error_type": "proxy_request", "context": method})),
                    ),
                }
            }
        }
    }

    /// Reject methods filtered out by `exposed_tools`. Returns the denial
    /// message, or None when the request may proceed.
    fn apply_tool_filter(
        &self,
        instance: &ProxyInstance,
        parsed: &McpMethod,
        method: &str,
        params: Option<&Value>,
    ) -> Option<String> {
        let exposed = &instance.config.exposed_tools;
        if exposed.is_empty() {
            return None;
        }

        match parsed {
            McpMethod::ToolsCall => {
                let tool_name = params
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if exposed.iter().any(|t| t == tool_name) {
                    None
                } else {
                    Some(format!("Method {} is not exposed in this proxy", tool_name))
                }
            }
            McpMethod::NotificationsInitialized => None,
            _ => {
                if exposed.iter().any(|t| t == method) {
                    None
                } else {
                    Some(format!("Method {} is not exposed in this proxy", method))
                }
            }
        }
    }

    /// Build the local initialize response for a proxy: negotiated
    /// protocol version, the gateway's capability set, and the proxy's
    /// inherited instructions at the top level.
    async fn initialize_response(&self, instance: &ProxyInstance, id: Option<Value>, params: Option<&Value>) -> Value {
        let client_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let instructions = self.inherited_instructions(&instance.config.name).await;
        let result = InitializeResult {
            protocol_version: negotiate_protocol_version(client_version).to_string(),
            capabilities: ServerCapabilities::gateway(),
            server_info: ServerInfo {
                name: format!("mcp-gateway-{}", instance.config.name),
                version: env!("CARGO_PKG_VERSION").to_string(),
                instructions: None,
            },
            instructions: if instructions.is_empty() { None } else { Some(instructions) },
        };

        let result = serde_json::to_value(result).unwrap_or(Value::Null);
        compliance::ensure_jsonrpc_response(json!({ "result": result }), id.as_ref())
    }

    /// The instructions a proxy advertises: its own, else the upstream's
    /// announced instructions, else the upstream's configured ones.
    pub async fn inherited_instructions(&self, name: &str) -> String {
        let (own, server_name) = {
            let proxies = self.proxies.read().await;
            match proxies.get(name) {
                Some(p) => (p.config.instructions.clone(), p.config.server_name.clone()),
                None => return String::new(),
            }
        };

        if !own.trim().is_empty() {
            return own.trim().to_string();
        }

        if let Some(info) = self.services.server_info(&server_name).await {
            if let Some(instructions) = info.instructions {
                if !instructions.trim().is_empty() {
                    return instructions.trim().to_string();
                }
            }
        }

        if let Some(config) = self.services.config(&server_name).await {
            if !config.instructions.trim().is_empty() {
                return config.instructions.trim().to_string();
            }
        }

        String::new()
    }

    /// Resolve a path segment to a proxy name. Exact match wins, then a
    /// case-insensitive name match, then an endpoint match.
    pub async fn resolve_name(&self, candidate: &str) -> Option<String> {
        let proxies = self.proxies.read().await;

        if proxies.contains_key(candidate) {
            return Some(candidate.to_string());
        }

        if let Some(name) = proxies
            .keys()
            .find(|name| name.eq_ignore_ascii_case(candidate))
        {
            return Some(name.clone());
        }

        let candidate = candidate.trim_matches('/');
        proxies
            .values()
            .find(|p| !p.config.endpoint_path().is_empty() && p.config.endpoint_path() == candidate)
            .map(|p| p.config.name.clone())
    }

    /// Snapshot one proxy for monitoring
    pub async fn status(&self, name: &str) -> Option<ProxySnapshot> {
        let proxies = self.proxies.read().await;
        proxies.get(name).map(snapshot)
    }

    /// Snapshot every proxy, sorted by name
    pub async fn statuses(&self) -> Vec<ProxySnapshot> {
        let proxies = self.proxies.read().await;
        let mut snapshots: Vec<_> = proxies.values().map(snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// The proxy's current filtered tool list
    pub async fn tools(&self, name: &str) -> Option<Vec<Value>> {
        let proxies = self.proxies.read().await;
        proxies.get(name).map(|p| p.tools.clone())
    }

    pub async fn config(&self, name: &str) -> Option<ProxyConfig> {
        let proxies = self.proxies.read().await;
        proxies.get(name).map(|p| p.config.clone())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.proxies.read().await.contains_key(name)
    }

    async fn server_name_of(&self, name: &str) -> McpResult<String> {
        let proxies = self.proxies.read().await;
        proxies
            .get(name)
            .map(|p| p.config.server_name.clone())
            .ok_or_else(|| McpError::ProxyNotFound { name: name.to_string() })
    }

    async fn mark_error(&self, name: &str, message: &str) {
        let mut proxies = self.proxies.write().await;
        if let Some(instance) = proxies.get_mut(name) {
            instance.status = ProxyStatus::Error;
            instance.error_message = Some(message.to_string());
        }
        warn!(proxy = name, "{}", message);
    }

    async fn update_lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.update_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn snapshot(instance: &ProxyInstance) -> ProxySnapshot {
    ProxySnapshot {
        name: instance.config.name.clone(),
        server_name: instance.config.server_name.clone(),
        endpoint: instance.config.endpoint.clone(),
        status: instance.status,
        tool_count: instance.tools.len(),
        exposed_tools: instance.config.exposed_tools.clone(),
        error_message: instance.error_message.clone(),
    }
}

/// Keep only the tools whose names appear in `exposed`; an empty filter
/// exposes everything.
fn filter_tools(tools: Vec<Value>, exposed: &[String]) -> Vec<Value> {
    if exposed.is_empty() {
        return tools;
    }
    tools
        .into_iter()
        .filter(|tool| {
            tool.get("name")
                .and_then(Value::as_str)
                .map(|name| exposed.iter().any(|e| e == name))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::ServiceConfig;
    use serde_json::json;

    async fn managers() -> (Arc<ServiceManager>, Arc<ProxyManager>) {
        let services = Arc::new(ServiceManager::new());
        services
            .add(ServiceConfig {
                name: "upstream".to_string(),
                command: "cat".to_string(),
                instructions: "configured instructions".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let proxies = Arc::new(ProxyManager::new(Arc::clone(&services)));
        proxies
            .add(ProxyConfig {
                name: "front".to_string(),
                server_name: "upstream".to_string(),
                endpoint: "/front-door".to_string(),
                exposed_tools: vec!["get-user".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        (services, proxies)
    }

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": "", "inputSchema": {"type": "object"}})
    }

    #[tokio::test]
    async fn test_add_remove_update() {
        let (_, proxies) = managers().await;
        assert!(proxies.contains("front").await);

        // Duplicates rejected
        let dup = ProxyConfig {
            name: "front".to_string(),
            server_name: "upstream".to_string(),
            ..Default::default()
        };
        assert!(proxies.add(dup).await.is_err());

        proxies.remove("front").await.unwrap();
        assert!(!proxies.contains("front").await);
    }

    #[tokio::test]
    async fn test_filter_tools() {
        let tools = vec![tool("get-user"), tool("delete-user")];
        let filtered = filter_tools(tools.clone(), &["get-user".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["name"], "get-user");

        let unfiltered = filter_tools(tools, &[]);
        assert_eq!(unfiltered.len(), 2);
    }

    #[tokio::test]
    async fn test_tools_list_served_from_cache() {
        let (_, proxies) = managers().await;
        {
            let mut map = proxies.proxies.write().await;
            let instance = map.get_mut("front").unwrap();
            instance.tools = vec![tool("get-user")];
            instance.status = ProxyStatus::Running;
        }

        let response = proxies
            .proxy_request("front", &json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await;
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["tools"][0]["name"], "get-user");
    }

    #[tokio::test]
    async fn test_filtered_tool_call_is_method_not_found() {
        let (_, proxies) = managers().await;
        let response = proxies
            .proxy_request(
                "front",
                &json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "tools/call",
                    "params": {"name": "delete-user", "arguments": {}}
                }),
            )
            .await;
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["id"], 2);
    }

    #[tokio::test]
    async fn test_resources_list_always_empty_success() {
        let (_, proxies) = managers().await;
        let response = proxies
            .proxy_request("front", &json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}))
            .await;
        assert_eq!(response["result"]["resources"], json!([]));

        let response = proxies
            .proxy_request(
                "front",
                &json!({"jsonrpc": "2.0", "id": 4, "method": "resources/templates/list"}),
            )
            .await;
        assert_eq!(response["result"]["resourceTemplates"], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_proxy_is_error_response() {
        let (_, proxies) = managers().await;
        let response = proxies
            .proxy_request("ghost", &json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"}))
            .await;
        assert!(response.get("error").is_some());
        assert_eq!(response["id"], 5);
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version_and_inherits_instructions() {
        let (_, proxies) = managers().await;

        let response = proxies
            .proxy_request(
                "front",
                &json!({
                    "jsonrpc": "2.0",
                    "id": 6,
                    "method": "initialize",
                    "params": {"protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {"name": "c"}}
                }),
            )
            .await;

        let result = &response["result"];
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"]["logging"], json!({}));
        assert_eq!(result["serverInfo"]["name"], "mcp-gateway-front");
        assert!(result["serverInfo"].get("instructions").is_none());
        // Proxy has no instructions of its own; the upstream's configured
        // text is inherited
        assert_eq!(result["instructions"], "configured instructions");

        // An unsupported client version falls back to the canonical one
        let response = proxies
            .proxy_request(
                "front",
                &json!({
                    "jsonrpc": "2.0",
                    "id": 7,
                    "method": "initialize",
                    "params": {"protocolVersion": "1999-01-01"}
                }),
            )
            .await;
        assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
    }

    #[tokio::test]
    async fn test_instructions_priority_order() {
        let (_, proxies) = managers().await;

        // Proxy's own instructions win when set
        {
            let mut map = proxies.proxies.write().await;
            map.get_mut("front").unwrap().config.instructions = "proxy text".to_string();
        }
        assert_eq!(proxies.inherited_instructions("front").await, "proxy text");

        // Unknown proxies inherit nothing
        assert_eq!(proxies.inherited_instructions("ghost").await, "");
    }

    #[tokio::test]
    async fn test_resolve_name_lookup_order() {
        let (_, proxies) = managers().await;

        assert_eq!(proxies.resolve_name("front").await.as_deref(), Some("front"));
        assert_eq!(proxies.resolve_name("FRONT").await.as_deref(), Some("front"));
        assert_eq!(proxies.resolve_name("front-door").await.as_deref(), Some("front"));
        assert_eq!(proxies.resolve_name("nope").await, None);
    }

    #[tokio::test]
    async fn test_start_requires_available_upstream() {
        let (_, proxies) = managers().await;
        // Upstream is stopped and unverified
        assert!(proxies.start("front").await.is_err());
        let snapshot = proxies.status("front").await.unwrap();
        assert_eq!(snapshot.status, ProxyStatus::Error);
        assert!(snapshot.error_message.is_some());
    }

    #[tokio::test]
    async fn test_stop_clears_tools() {
        let (_, proxies) = managers().await;
        {
            let mut map = proxies.proxies.write().await;
            let instance = map.get_mut("front").unwrap();
            instance.tools = vec![tool("get-user")];
            instance.status = ProxyStatus::Running;
        }

        proxies.stop("front").await.unwrap();
        let snapshot = proxies.status("front").await.unwrap();
        assert_eq!(snapshot.status, ProxyStatus::Stopped);
        assert_eq!(snapshot.tool_count, 0);
    }

    #[tokio::test]
    async fn test_update_tools_uses_cached_upstream_tools() {
        let (services, proxies) = managers().await;

        // Simulate a verified upstream with cached tools
        {
            let mut map = services.services_for_tests().write().await;
            let instance = map.get_mut("upstream").unwrap();
            instance.tools = vec![tool("get-user"), tool("delete-user")];
            instance.status = crate::service::ServiceStatus::Running;
        }

        let tools = proxies.update_tools("front").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "get-user");
        assert_eq!(proxies.status("front").await.unwrap().status, ProxyStatus::Running);
    }
}
