//! Streamable HTTP transport adapter
//!
//! Speaks MCP over plain HTTP POST: each JSON-RPC request is posted to the
//! endpoint, and the reply arrives either as a single JSON frame or as a
//! short-lived event stream whose frames are correlated by request id. The
//! upstream may assign a session id on initialize; it is echoed on every
//! subsequent request and released with a DELETE on close.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use async_trait::async_trait;
use gateway_config::ServiceConfig;

use super::events::SseEventParser;
use super::{initialize_params, resolve_response, McpConnector, CALL_TIMEOUT};
use crate::compliance;
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Session id header defined by the streamable HTTP transport
const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport adapter
pub struct StreamableHttpConnector {
    client: Client,

    /// Endpoint URL
    url: Url,

    /// Headers forwarded verbatim to the upstream
    headers: Vec<(String, String)>,

    /// Session id assigned by the upstream, if any
    session_id: Option<String>,

    /// Next request id
    next_id: u64,

    /// Whether the session is usable
    connected: bool,
}

impl StreamableHttpConnector {
    /// Create the adapter; the connection itself is per-request HTTP
    pub async fn connect(config: &ServiceConfig) -> McpResult<Self> {
        let url = Url::parse(&config.url)?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            url,
            headers: config.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            session_id: None,
            next_id: 1,
            connected: true,
        })
    }

    fn build_post(&self, body: &JsonRpcRequest) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.url.clone())
            .timeout(CALL_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }

    fn capture_session_id(&mut self, response: &Response) {
        if let Some(value) = response.headers().get(SESSION_ID_HEADER) {
            if let Ok(value) = value.to_str() {
                if self.session_id.as_deref() != Some(value) {
                    debug!(session_id = value, "upstream assigned session id");
                    self.session_id = Some(value.to_string());
                }
            }
        }
    }

    /// Read the response body; a JSON body is one frame, an event-stream
    /// body is scanned for the frame whose id matches.
    async fn read_response(response: Response, id: u64) -> McpResult<JsonRpcResponse> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let mut stream = response.bytes_stream();
            let mut parser = SseEventParser::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| McpError::Transport {
                    message: format!("response stream failed: {}", e),
                })?;
                let Ok(text) = std::str::from_utf8(&chunk) else {
                    continue;
                };
                for event in parser.push(text) {
                    if event.event != "message" {
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                        continue;
                    };
                    if value.get("id") == Some(&json!(id)) {
                        return serde_json::from_value(value).map_err(McpError::from);
                    }
                }
            }

            return Err(McpError::Transport {
                message: "response stream ended without a matching frame".to_string(),
            });
        }

        let body: Value = response.json().await?;
        serde_json::from_value(body).map_err(McpError::from)
    }

    async fn send_request(&mut self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse> {
        if !self.connected {
            return Err(McpError::Transport {
                message: "Transport not connected".to_string(),
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest::new(method, params, Some(json!(id)));

        let exchange = async {
            let response = self.build_post(&request).send().await?;
            if !response.status().is_success() {
                return Err(McpError::Transport {
                    message: format!("request failed with status: {}", response.status()),
                });
            }
            self.capture_session_id(&response);
            Self::read_response(response, id).await
        };

        match timeout(CALL_TIMEOUT, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.connected = false;
                Err(e)
            }
            Err(_) => {
                self.connected = false;
                Err(McpError::Timeout { timeout: CALL_TIMEOUT })
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> McpResult<()> {
        let request = JsonRpcRequest::notification(method, params);
        let response = self.build_post(&request).send().await?;
        if !response.status().is_success() {
            return Err(McpError::Transport {
                message: format!("notification failed with status: {}", response.status()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl McpConnector for StreamableHttpConnector {
    async fn initialize(&mut self) -> McpResult<Value> {
        let response = self.send_request("initialize", Some(initialize_params())).await?;
        let result = resolve_response("initialize", response)?;
        if let Err(e) = self.notify("notifications/initialized", None).await {
            warn!("initialized notification failed: {}", e);
        }
        Ok(compliance::normalize_initialize_response(result))
    }

    async fn call(&mut self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let response = self.send_request(method, params).await?;
        resolve_response(method, response)
    }

    async fn close(&mut self) -> McpResult<()> {
        self.connected = false;

        // Release the upstream session if one was assigned
        if let Some(session_id) = self.session_id.take() {
            let mut request = self
                .client
                .delete(self.url.clone())
                .timeout(Duration::from_secs(5))
                .header(SESSION_ID_HEADER, &session_id);
            for (key, value) in &self.headers {
                request = request.header(key, value);
            }
            if let Err(e) = request.send().await {
                debug!(session_id, "session release failed: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::TransportKind;

    fn config(url: &str) -> ServiceConfig {
        ServiceConfig {
            name: "remote".to_string(),
            transport: TransportKind::StreamableHttp,
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_validates_url() {
        assert!(StreamableHttpConnector::connect(&config("::::")).await.is_err());
        assert!(StreamableHttpConnector::connect(&config("https://example.com/mcp"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_headers_are_forwarded() {
        let mut cfg = config("https://example.com/mcp");
        cfg.headers
            .insert("Authorization".to_string(), "Bearer token".to_string());

        let connector = StreamableHttpConnector::connect(&cfg).await.unwrap();
        let request = connector
            .build_post(&JsonRpcRequest::with_id("tools/list", None, "1"))
            .build()
            .unwrap();
        assert_eq!(request.headers().get("Authorization").unwrap(), "Bearer token");
    }

    #[tokio::test]
    async fn test_session_id_echoed_after_capture() {
        let mut connector = StreamableHttpConnector::connect(&config("https://example.com/mcp"))
            .await
            .unwrap();
        connector.session_id = Some("abc123".to_string());

        let request = connector
            .build_post(&JsonRpcRequest::with_id("tools/list", None, "1"))
            .build()
            .unwrap();
        assert_eq!(request.headers().get(SESSION_ID_HEADER).unwrap(), "abc123");
    }
}
