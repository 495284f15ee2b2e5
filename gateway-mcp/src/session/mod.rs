//! SSE session engine
//!
//! Tracks every live SSE connection: identity, bounded pending-message
//! queues, rate-limited registration, and background cleanup. All three
//! maps (sessions, per-client history, violations) live behind one mutex,
//! and no critical section spans a suspension point, so the engine's
//! methods are synchronous; only request handling awaits.

pub mod heartbeat;
pub mod rate_limit;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gateway_config::{RateLimitConfig, SessionConfig};

use crate::compliance;
use crate::error::{McpError, McpResult};
use crate::proxy::ProxyManager;
use self::heartbeat::HeartbeatManager;
use self::rate_limit::{RateLimitOutcome, RateLimitState, RateLimitViolation};

/// One JSON-RPC frame queued for delivery to an SSE session
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub payload: Value,
    pub enqueued_at: Instant,
    pub max_retries: u32,
    pub timeout: Duration,
}

/// One live SSE connection
#[derive(Debug)]
pub struct SseSession {
    pub session_id: String,
    pub proxy_name: String,
    pub client_ip: String,
    pub created_at: Instant,
    pub created_wall: DateTime<Utc>,
    pub last_activity: Instant,
    pub pending_messages: VecDeque<PendingMessage>,
    pub is_initialized: bool,
}

/// Age/activity histogram buckets for monitoring
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AgeBuckets {
    pub under_1min: usize,
    pub min_1_to_5: usize,
    pub min_5_to_30: usize,
    pub over_30min: usize,
}

impl AgeBuckets {
    fn count(&mut self, age: Duration) {
        match age.as_secs() {
            0..=59 => self.under_1min += 1,
            60..=299 => self.min_1_to_5 += 1,
            300..=1799 => self.min_5_to_30 += 1,
            _ => self.over_30min += 1,
        }
    }
}

/// Session statistics for the monitoring surface
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub sessions_by_proxy: HashMap<String, usize>,
    pub sessions_by_client: HashMap<String, usize>,
    pub sessions_by_age: AgeBuckets,
    pub sessions_by_activity: AgeBuckets,
    pub sessions_with_pending_messages: usize,
    pub total_pending_messages: usize,
    pub oldest_session_age_seconds: u64,
    pub newest_session_age_seconds: u64,
    pub tracked_clients: usize,
    pub clients_near_limit: Vec<(String, usize)>,
}

struct EngineState {
    sessions: HashMap<String, SseSession>,
    rate_limits: RateLimitState,
}

/// Owner of every SSE session
pub struct SessionEngine {
    config: SessionConfig,
    state: Mutex<EngineState>,
    proxies: Arc<ProxyManager>,
    heartbeats: Arc<HeartbeatManager>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl SessionEngine {
    pub fn new(
        config: SessionConfig,
        rate_limit: RateLimitConfig,
        proxies: Arc<ProxyManager>,
        heartbeats: Arc<HeartbeatManager>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(EngineState {
                sessions: HashMap::new(),
                rate_limits: RateLimitState::new(rate_limit),
            }),
            proxies,
            heartbeats,
            cleanup_task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("session engine lock")
    }

    /// Register a new session, subject to rate limiting. Registering an
    /// id that already exists replaces the old session.
    pub fn register_session(&self, session_id: &str, proxy_name: &str, client_ip: &str) -> McpResult<()> {
        let now = Instant::now();
        let mut state = self.lock();

        let proxy_sessions = state
            .sessions
            .values()
            .filter(|s| s.proxy_name == proxy_name)
            .count();

        match state
            .rate_limits
            .evaluate(client_ip, proxy_name, proxy_sessions, now)
        {
            RateLimitOutcome::Allowed => {}
            RateLimitOutcome::Denied { reason } => {
                return Err(McpError::RateLimitExceeded {
                    message: reason,
                    retry_after: Some(state.rate_limits.config().session_creation_window.as_secs()),
                });
            }
        }

        if let Some(existing) = state.sessions.get(session_id) {
            warn!(
                session_id,
                old_proxy = %existing.proxy_name,
                new_proxy = %proxy_name,
                age_secs = existing.created_at.elapsed().as_secs(),
                "duplicate session id, replacing existing session"
            );
        }

        state.sessions.insert(
            session_id.to_string(),
            SseSession {
                session_id: session_id.to_string(),
                proxy_name: proxy_name.to_string(),
                client_ip: client_ip.to_string(),
                created_at: now,
                created_wall: Utc::now(),
                last_activity: now,
                pending_messages: VecDeque::new(),
                is_initialized: false,
            },
        );

        info!(
            session_id,
            proxy = proxy_name,
            client = client_ip,
            total = state.sessions.len(),
            "SSE session registered"
        );
        Ok(())
    }

    /// Remove a session. Returns whether it was still present, so
    /// concurrent cancellation paths can never unregister twice.
    pub fn unregister_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            state.sessions.remove(session_id)
        };

        match removed {
            Some(session) => {
                self.heartbeats.remove_session(session_id);
                let age = session.created_at.elapsed();
                let undelivered = session.pending_messages.len();
                info!(
                    session_id,
                    proxy = %session.proxy_name,
                    age_secs = age.as_secs(),
                    undelivered,
                    "SSE session unregistered"
                );
                if undelivered > 0 {
                    warn!(session_id, undelivered, "session had undelivered messages");
                }
                true
            }
            None => {
                debug!(session_id, "unregister for unknown session ignored");
                false
            }
        }
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// The proxy a session is attached to, refreshing its activity clock
    pub fn session_proxy(&self, session_id: &str) -> Option<String> {
        let mut state = self.lock();
        state.sessions.get_mut(session_id).map(|s| {
            s.last_activity = Instant::now();
            s.proxy_name.clone()
        })
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Queue a message for delivery. Priority messages jump to the head
    /// of the FIFO; the queue never grows past the configured bound (the
    /// oldest entry is dropped to make room).
    pub fn add_message(&self, session_id: &str, payload: Value, priority: bool) -> bool {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return false;
        };

        if session.pending_messages.len() >= self.config.max_pending_messages {
            warn!(session_id, "pending queue full, dropping oldest message");
            session.pending_messages.pop_front();
        }

        let message = PendingMessage {
            payload,
            enqueued_at: Instant::now(),
            max_retries: 3,
            timeout: self.config.message_timeout,
        };

        if priority {
            session.pending_messages.push_front(message);
        } else {
            session.pending_messages.push_back(message);
        }
        session.last_activity = Instant::now();
        true
    }

    /// Drain a session's queue, dropping entries older than their
    /// per-message timeout.
    pub fn get_pending_messages(&self, session_id: &str) -> Vec<Value> {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut messages = Vec::new();

        while let Some(message) = session.pending_messages.pop_front() {
            if now.duration_since(message.enqueued_at) > message.timeout {
                warn!(session_id, "dropping expired pending message");
                continue;
            }
            messages.push(message.payload);
        }

        if !messages.is_empty() {
            session.last_activity = now;
        }
        messages
    }

    pub fn mark_initialized(&self, session_id: &str) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.is_initialized = true;
        }
    }

    /// Handle one MCP message arriving on a session's message endpoint.
    /// `initialize`, `tools/list`, and `tools/call` are answered from the
    /// gateway's own state; everything else is forwarded upstream through
    /// the proxy manager.
    pub async fn handle_message(&self, session_id: &str, message: &Value) -> Value {
        let proxy_name = {
            let mut state = self.lock();
            match state.sessions.get_mut(session_id) {
                Some(session) => {
                    session.last_activity = Instant::now();
                    if message.get("method").and_then(Value::as_str) == Some("initialize") {
                        session.is_initialized = true;
                    }
                    session.proxy_name.clone()
                }
                None => {
                    return compliance::error_response(
                        message.get("id").cloned(),
                        -32001,
                        "Session not found",
                        None,
                    );
                }
            }
        };

        self.proxies.proxy_request(&proxy_name, message).await
    }

    /// Queue one payload to every session attached to a proxy
    pub fn broadcast_to_proxy(&self, proxy_name: &str, payload: &Value) -> usize {
        let session_ids = self.sessions_by_proxy(proxy_name);
        let mut sent = 0;
        for session_id in session_ids {
            if self.add_message(&session_id, payload.clone(), false) {
                sent += 1;
            }
        }
        info!(proxy = proxy_name, sent, "broadcast queued");
        sent
    }

    pub fn sessions_by_proxy(&self, proxy_name: &str) -> Vec<String> {
        let state = self.lock();
        state
            .sessions
            .values()
            .filter(|s| s.proxy_name == proxy_name)
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Expire sessions per the cleanup predicates. Thresholds tighten as
    /// the session population grows so a flood sheds load sooner.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = Instant::now();
        let base_timeout = self.config.session_timeout;
        let base_pending = self.config.max_pending_messages;
        let hard_age_cap = base_timeout * 3;
        let uninitialized_timeout = self.config.uninitialized_timeout;

        let mut state = self.lock();
        let total = state.sessions.len();

        let (idle_timeout, pending_cap) = if total > 100 {
            (base_timeout / 2, base_pending / 2)
        } else if total > 50 {
            (base_timeout * 3 / 4, base_pending * 3 / 4)
        } else {
            (base_timeout, base_pending)
        };

        let expired: Vec<String> = state
            .sessions
            .values()
            .filter(|s| {
                let idle = now.duration_since(s.last_activity);
                let age = now.duration_since(s.created_at);
                idle > idle_timeout
                    || age > hard_age_cap
                    || s.pending_messages.len() > pending_cap
                    || (!s.is_initialized && age > uninitialized_timeout)
            })
            .map(|s| s.session_id.clone())
            .collect();

        for session_id in &expired {
            if let Some(session) = state.sessions.remove(session_id) {
                debug!(
                    session_id,
                    proxy = %session.proxy_name,
                    idle_secs = now.duration_since(session.last_activity).as_secs(),
                    "session expired"
                );
            }
        }
        drop(state);

        for session_id in &expired {
            self.heartbeats.remove_session(session_id);
        }

        if !expired.is_empty() {
            info!(removed = expired.len(), remaining = total - expired.len(), "session cleanup pass");
        }
        expired.len()
    }

    /// Start the periodic cleanup task; a second call while running is a
    /// no-op.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = Arc::clone(self);
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "session cleanup task started");
            loop {
                tokio::time::sleep(interval).await;
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                engine.cleanup_expired_sessions();
            }
        });

        *self.cleanup_task.lock().expect("cleanup task lock") = Some(handle);
    }

    pub fn stop_cleanup_task(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.cleanup_task.lock().expect("cleanup task lock").take() {
            handle.abort();
            info!("session cleanup task stopped");
        }
    }

    /// Detailed session statistics for monitoring
    pub fn stats(&self) -> SessionStats {
        let now = Instant::now();
        let state = self.lock();

        let mut stats = SessionStats {
            total_sessions: state.sessions.len(),
            sessions_by_proxy: HashMap::new(),
            sessions_by_client: HashMap::new(),
            sessions_by_age: AgeBuckets::default(),
            sessions_by_activity: AgeBuckets::default(),
            sessions_with_pending_messages: 0,
            total_pending_messages: 0,
            oldest_session_age_seconds: 0,
            newest_session_age_seconds: 0,
            tracked_clients: state.rate_limits.tracked_clients(),
            clients_near_limit: state.rate_limits.clients_near_limit(now),
        };

        let mut ages: Vec<Duration> = Vec::with_capacity(state.sessions.len());

        for session in state.sessions.values() {
            let age = now.duration_since(session.created_at);
            let idle = now.duration_since(session.last_activity);
            ages.push(age);

            *stats
                .sessions_by_proxy
                .entry(session.proxy_name.clone())
                .or_default() += 1;
            *stats
                .sessions_by_client
                .entry(session.client_ip.clone())
                .or_default() += 1;

            stats.sessions_by_age.count(age);
            stats.sessions_by_activity.count(idle);

            let pending = session.pending_messages.len();
            if pending > 0 {
                stats.sessions_with_pending_messages += 1;
                stats.total_pending_messages += pending;
            }
        }

        stats.oldest_session_age_seconds = ages.iter().max().map(|d| d.as_secs()).unwrap_or(0);
        stats.newest_session_age_seconds = ages.iter().min().map(|d| d.as_secs()).unwrap_or(0);
        stats
    }

    /// Recorded rate-limit violations for one client
    pub fn violations_for(&self, client_ip: &str) -> Vec<RateLimitViolation> {
        self.lock().rate_limits.violations_for(client_ip)
    }

    /// Drop rate-limit history for one client, or for everyone
    pub fn clear_rate_limit_history(&self, client_ip: Option<&str>) -> usize {
        let cleared = self.lock().rate_limits.clear_history(client_ip);
        info!(?client_ip, cleared, "rate limit history cleared");
        cleared
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        if let Ok(mut task) = self.cleanup_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
