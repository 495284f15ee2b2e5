//! Server-Sent Events transport adapter
//!
//! Opens the upstream's SSE stream, discovers the paired message endpoint
//! from the stream's first `endpoint` event, POSTs JSON-RPC requests to it,
//! and correlates responses flowing back on the stream by request id.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use async_trait::async_trait;
use gateway_config::ServiceConfig;

use super::events::{SseEvent, SseEventParser};
use super::{initialize_params, resolve_response, McpConnector, CALL_TIMEOUT};
use crate::compliance;
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// How long to wait for the stream's opening `endpoint` event
const ENDPOINT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// SSE transport adapter owning one upstream stream
pub struct SseConnector {
    /// HTTP client shared by stream and message POSTs
    client: Client,

    /// Headers forwarded verbatim to the upstream
    headers: Vec<(String, String)>,

    /// Message endpoint announced by the stream
    message_url: Url,

    /// Events arriving on the stream
    events: mpsc::Receiver<SseEvent>,

    /// Task pumping the response body into `events`
    stream_task: JoinHandle<()>,

    /// Next request id
    next_id: u64,

    /// Whether the session is usable
    connected: bool,
}

impl SseConnector {
    /// Open the upstream stream and wait for its endpoint announcement
    pub async fn connect(config: &ServiceConfig) -> McpResult<Self> {
        let base_url = Url::parse(&config.url)?;
        let headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let mut request = client
            .get(base_url.clone())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (key, value) in &headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| McpError::ConnectionFailed {
            message: format!("Failed to connect to SSE endpoint: {}", e),
        })?;

        if !response.status().is_success() {
            return Err(McpError::ConnectionFailed {
                message: format!("SSE connection failed with status: {}", response.status()),
            });
        }

        let (tx, mut events) = mpsc::channel(100);
        let stream_task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseEventParser::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("SSE stream ended: {}", e);
                        break;
                    }
                };
                let Ok(text) = std::str::from_utf8(&chunk) else {
                    continue;
                };
                for event in parser.push(text) {
                    if tx.send(event).await.is_err() {
                        return; // receiver dropped
                    }
                }
            }
        });

        // The first frame on a conforming stream names the message endpoint
        let discovered = timeout(ENDPOINT_DISCOVERY_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if event.event == "endpoint" {
                    return Some(event.data);
                }
                debug!(event = %event.event, "ignoring pre-endpoint event");
            }
            None
        })
        .await;

        let message_url = match discovered {
            Ok(Some(data)) => data,
            Ok(None) => {
                stream_task.abort();
                return Err(McpError::ConnectionFailed {
                    message: "SSE stream closed before the endpoint event".to_string(),
                });
            }
            Err(_) => {
                stream_task.abort();
                return Err(McpError::ConnectionFailed {
                    message: "upstream sent no endpoint event".to_string(),
                });
            }
        };

        let message_url = match base_url.join(message_url.trim()) {
            Ok(url) => url,
            Err(e) => {
                stream_task.abort();
                return Err(McpError::Protocol {
                    message: format!("upstream announced an invalid message endpoint: {}", e),
                });
            }
        };

        Ok(Self {
            client,
            headers,
            message_url,
            events,
            stream_task,
            next_id: 1,
            connected: true,
        })
    }

    async fn post_message(&self, body: &JsonRpcRequest) -> McpResult<Option<Value>> {
        let mut request = self
            .client
            .post(self.message_url.clone())
            .timeout(CALL_TIMEOUT)
            .header("Content-Type", "application/json")
            .json(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(McpError::Transport {
                message: format!("message POST failed with status: {}", response.status()),
            });
        }

        // Some servers answer the POST with the JSON-RPC response directly
        // instead of (or as well as) emitting it on the stream
        let text = response.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&text).ok())
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
            if let Some(direct) = self.post_message(&request).await? {
                if direct.get("id") == Some(&json!(id)) {
                    return serde_json::from_value::<JsonRpcResponse>(direct).map_err(McpError::from);
                }
            }

            // Otherwise the response arrives out-of-band on the stream
            loop {
                let event = self.events.recv().await.ok_or_else(|| McpError::ConnectionFailed {
                    message: "SSE stream ended".to_string(),
                })?;
                if event.event != "message" {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                    continue;
                };
                if value.get("id") == Some(&json!(id)) {
                    return serde_json::from_value::<JsonRpcResponse>(value).map_err(McpError::from);
                }
                debug!(method, "skipping unrelated stream frame");
            }
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
        self.post_message(&request).await.map(|_| ())
    }
}

#[async_trait]
impl McpConnector for SseConnector {
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
        self.stream_task.abort();
        self.events.close();
        Ok(())
    }
}

impl Drop for SseConnector {
    fn drop(&mut self) {
        self.stream_task.abort();
    }
}
