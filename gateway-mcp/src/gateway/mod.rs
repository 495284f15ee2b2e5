//! HTTP dispatch for the gateway's three transport entry points
//!
//! The host mounts [`routes`] into its axum application; everything behind
//! them is transport-neutral core machinery. A warmup `GET` answers
//! `{"status":"ok"}` unless the client asks for an SSE stream, in which
//! case the stream opens with the `endpoint` event and enters the
//! heartbeat/drain loop. JSON-RPC `POST`s dispatch through the proxy
//! manager, and `POST /messages` routes a frame into an existing session,
//! answering `202 Accepted` with the response delivered out-of-band.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gateway_config::GatewayConfig;

use crate::compliance;
use crate::error::McpError;
use crate::proxy::ProxyManager;
use crate::service::ServiceManager;
use crate::session::heartbeat::{system_load, HeartbeatManager};
use crate::session::SessionEngine;

/// Everything the entry points need, built once at startup and handed to
/// the router as state
#[derive(Clone)]
pub struct GatewayContext {
    pub services: Arc<ServiceManager>,
    pub proxies: Arc<ProxyManager>,
    pub sessions: Arc<SessionEngine>,
    pub heartbeats: Arc<HeartbeatManager>,
}

impl GatewayContext {
    /// Assemble the managers from a parsed configuration
    pub async fn from_config(config: GatewayConfig) -> Self {
        let services = Arc::new(ServiceManager::with_configs(config.services).await);
        let proxies = Arc::new(ProxyManager::with_configs(Arc::clone(&services), config.proxies).await);
        let heartbeats = Arc::new(HeartbeatManager::new(config.heartbeat));
        let sessions = Arc::new(SessionEngine::new(
            config.sessions,
            config.rate_limit,
            Arc::clone(&proxies),
            Arc::clone(&heartbeats),
        ));

        Self {
            services,
            proxies,
            sessions,
            heartbeats,
        }
    }

    /// Bring auto-start services and proxies up and start housekeeping
    pub async fn startup(&self) {
        self.services.auto_start_all().await;
        self.proxies.auto_start_all().await;
        self.sessions.start_cleanup_task();
        info!("gateway context started");
    }

    /// Cancel housekeeping tasks
    pub fn shutdown(&self) {
        self.sessions.stop_cleanup_task();
        info!("gateway context stopped");
    }
}

/// Routes for the three transport entry points
pub fn routes() -> Router<GatewayContext> {
    Router::new()
        .route("/messages", post(session_message_handler))
        .route("/{proxy}", get(warmup_handler).post(rpc_handler))
        .route("/{proxy}/{*path}", get(warmup_path_handler).post(proxy_path_post_handler))
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(86_400))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Best-effort client address from proxy headers. The gateway normally
/// sits behind a reverse proxy, so the forwarded headers are the usable
/// signal; absent those, all clients share one bucket.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }
    "unknown".to_string()
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Warmup `GET /{proxy}`: liveness answer, or an SSE stream when asked
async fn warmup_handler(
    State(ctx): State<GatewayContext>,
    Path(proxy): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_warmup(ctx, proxy, headers).await
}

/// Warmup `GET /{proxy}/{endpoint}`: same contract on endpoint paths
async fn warmup_path_handler(
    State(ctx): State<GatewayContext>,
    Path((proxy, _path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_warmup(ctx, proxy, headers).await
}

async fn serve_warmup(ctx: GatewayContext, proxy: String, headers: HeaderMap) -> Response {
    let Some(proxy_name) = ctx.proxies.resolve_name(&proxy).await else {
        return McpError::ProxyNotFound { name: proxy }.into_response();
    };

    if !wants_event_stream(&headers) {
        debug!(proxy = %proxy_name, "warmup ping");
        return Json(json!({"status": "ok"})).into_response();
    }

    let ip = client_ip(&headers);
    open_sse_stream(ctx, proxy_name, ip).await
}

/// Open one client SSE stream: register the session, emit the endpoint
/// event, then alternate between draining pending messages and emitting
/// heartbeat pings until the client goes away.
async fn open_sse_stream(ctx: GatewayContext, proxy_name: String, client_ip: String) -> Response {
    let session_id = Uuid::new_v4().to_string();

    if let Err(e) = ctx.sessions.register_session(&session_id, &proxy_name, &client_ip) {
        return e.into_response();
    }

    // The guard travels into the stream; wherever the stream is dropped,
    // the session unregisters exactly once
    let guard = SessionGuard {
        sessions: Arc::clone(&ctx.sessions),
        session_id: session_id.clone(),
    };

    info!(session_id, proxy = %proxy_name, client = %client_ip, "SSE stream opened");
    let stream = session_event_stream(ctx, session_id, guard);
    Sse::new(stream).into_response()
}

/// Unregisters its session exactly once, whichever way the stream ends
struct SessionGuard {
    sessions: Arc<SessionEngine>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.unregister_session(&self.session_id);
    }
}

fn session_event_stream(
    ctx: GatewayContext,
    session_id: String,
    guard: SessionGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // The first frame always names the message endpoint
        yield Ok(Event::default()
            .event("endpoint")
            .data(format!("/messages?sessionId={}", session_id)));

        let check_interval = ctx.heartbeats.config().check_interval;
        let mut next_ping = Instant::now() + ctx.heartbeats.adaptive_interval(&session_id, system_load());

        loop {
            tokio::time::sleep(check_interval).await;

            // The cleanup task may have expired the session
            if !guard.sessions.has_session(&session_id) {
                debug!(session_id, "session gone, ending stream");
                break;
            }

            for payload in guard.sessions.get_pending_messages(&session_id) {
                yield Ok(Event::default().event("message").data(payload.to_string()));
            }

            if Instant::now() >= next_ping {
                let started = Instant::now();
                let ping = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/ping",
                    "params": {
                        "timestamp": Utc::now().to_rfc3339(),
                        "sessionId": session_id,
                    },
                });
                yield Ok(Event::default().event("ping").data(ping.to_string()));

                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                ctx.heartbeats.record_heartbeat(&session_id, true, elapsed_ms);

                let interval = ctx.heartbeats.adaptive_interval(&session_id, system_load());
                next_ping = Instant::now() + interval;
            }
        }

        drop(guard);
    }
}

/// JSON-RPC `POST /{proxy}`
async fn rpc_handler(
    State(ctx): State<GatewayContext>,
    Path(proxy): Path<String>,
    body: String,
) -> Response {
    dispatch_rpc(ctx, proxy, body).await
}

/// `POST /{proxy}/{path}`: the `messages` suffix routes into the session
/// engine, anything else is a JSON-RPC request on an endpoint path
async fn proxy_path_post_handler(
    State(ctx): State<GatewayContext>,
    Path((proxy, path)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> Response {
    if path.trim_matches('/') == "messages" {
        return handle_session_message(ctx, query.session_id, body).await;
    }
    dispatch_rpc(ctx, proxy, body).await
}

async fn dispatch_rpc(ctx: GatewayContext, proxy: String, body: String) -> Response {
    let Some(proxy_name) = ctx.proxies.resolve_name(&proxy).await else {
        return McpError::ProxyNotFound { name: proxy }.into_response();
    };

    let message: Value = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(e) => {
            let response =
                compliance::error_response(None, -32700, &format!("Parse error: {}", e), None);
            return Json(response).into_response();
        }
    };

    // Notifications get no response body
    if message.get("id").map_or(true, Value::is_null) {
        debug!(proxy = %proxy_name, "notification accepted");
        return StatusCode::ACCEPTED.into_response();
    }

    let response = ctx.proxies.proxy_request(&proxy_name, &message).await;
    Json(response).into_response()
}

/// `POST /messages?sessionId=…`
async fn session_message_handler(
    State(ctx): State<GatewayContext>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> Response {
    handle_session_message(ctx, query.session_id, body).await
}

/// Route one frame into an existing SSE session. The JSON-RPC response is
/// queued onto the session's stream with priority; the POST itself only
/// acknowledges acceptance.
async fn handle_session_message(ctx: GatewayContext, session_id: Option<String>, body: String) -> Response {
    let message: Value = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(e) => {
            let response =
                compliance::error_response(None, -32700, &format!("Parse error: {}", e), None);
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    // The session id may ride in the query string or the body
    let session_id = session_id.or_else(|| {
        message
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let Some(session_id) = session_id else {
        return McpError::InvalidRequest {
            message: "sessionId is required".to_string(),
        }
        .into_response();
    };

    if !ctx.sessions.has_session(&session_id) {
        warn!(session_id, "message for unknown session");
        return (
            StatusCode::NOT_FOUND,
            Json(compliance::error_response(
                message.get("id").cloned(),
                -32001,
                "Session not found",
                None,
            )),
        )
            .into_response();
    }

    let is_notification = message.get("id").map_or(true, Value::is_null);
    if is_notification {
        // Notifications update activity but produce no queued response
        let _ = ctx.sessions.session_proxy(&session_id);
        if message.get("method").and_then(Value::as_str) == Some("notifications/initialized") {
            ctx.sessions.mark_initialized(&session_id);
        }
    } else {
        let response = ctx.sessions.handle_message(&session_id, &message).await;
        ctx.sessions.add_message(&session_id, response, true);
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "sessionId": session_id})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::{ProxyConfig, ServiceConfig};
    use tower::ServiceExt;

    async fn test_context() -> GatewayContext {
        let config = GatewayConfig {
            services: vec![ServiceConfig {
                name: "upstream".to_string(),
                command: "cat".to_string(),
                ..Default::default()
            }],
            proxies: vec![ProxyConfig {
                name: "front".to_string(),
                server_name: "upstream".to_string(),
                endpoint: "/front".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        GatewayContext::from_config(config).await
    }

    fn app(ctx: GatewayContext) -> Router {
        routes().with_state(ctx)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_warmup_ok() {
        let app = app(test_context().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/front")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_warmup_unknown_proxy_404() {
        let app = app(test_context().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/ghost")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_warmup_case_insensitive_lookup() {
        let app = app(test_context().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/FRONT")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sse_stream_first_frame_is_endpoint_event() {
        let app = app(test_context().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/front")
                    .header("accept", "text/event-stream")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));

        // Read the first chunk only; the stream itself is unbounded
        let mut body = response.into_body().into_data_stream();
        let first = tokio_stream::StreamExt::next(&mut body).await.unwrap().unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.starts_with("event: endpoint\n"), "got: {}", text);

        let session_id = text
            .lines()
            .find_map(|l| l.strip_prefix("data: /messages?sessionId="))
            .expect("endpoint data line");
        // Session ids are UUIDs
        assert_eq!(session_id.trim().len(), 36);
        assert!(Uuid::parse_str(session_id.trim()).is_ok());
    }

    #[tokio::test]
    async fn test_rpc_post_tools_list() {
        let ctx = test_context().await;
        let app = app(ctx);
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/front")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["tools"], json!([]));
    }

    #[tokio::test]
    async fn test_rpc_post_parse_error() {
        let app = app(test_context().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/front")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32700);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_rpc_notification_gets_202() {
        let app = app(test_context().await);
        let request = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/front")
                    .body(axum::body::Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_session_message_unknown_session_404() {
        let app = app(test_context().await);
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/messages?sessionId=nope")
                    .body(axum::body::Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn test_session_message_accepted_and_response_queued() {
        let ctx = test_context().await;
        ctx.sessions
            .register_session("sid-1", "front", "1.2.3.4")
            .unwrap();

        let app = app(ctx.clone());
        let request = json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/messages?sessionId=sid-1")
                    .body(axum::body::Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        // The POST acknowledges; the JSON-RPC response rides the stream
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["sessionId"], "sid-1");

        let pending = ctx.sessions.get_pending_messages("sid-1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["id"], 9);
        assert_eq!(pending[0]["result"]["tools"], json!([]));
    }

    #[tokio::test]
    async fn test_session_message_requires_session_id() {
        let app = app(test_context().await);
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/messages")
                    .body(axum::body::Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_proxy_messages_path_routes_to_session_engine() {
        let ctx = test_context().await;
        ctx.sessions
            .register_session("sid-2", "front", "1.2.3.4")
            .unwrap();

        let app = app(ctx);
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/front/messages?sessionId=sid-2")
                    .body(axum::body::Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_client_ip_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");

        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.0.0.9");

        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "1.2.3.4");
    }
}
