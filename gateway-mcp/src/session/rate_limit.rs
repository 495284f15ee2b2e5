//! Session-creation rate limiting with violation tracking
//!
//! The session engine consults this state under its own mutex; nothing in
//! here blocks or suspends. Denials are recorded as violations (bounded
//! per client) and cached briefly so a misbehaving client hammering the
//! endpoint does not flood the logs with identical decisions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use gateway_config::RateLimitConfig;

/// Which cap a violation tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ClientLimit,
    ProxyLimit,
}

/// How far past the cap the client was
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One recorded rate-limit denial
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitViolation {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub proxy_name: String,
    pub kind: ViolationKind,
    pub severity: ViolationSeverity,
    pub details: String,
}

/// Severity ladder over the observed session count relative to the cap
pub fn severity_for(observed: usize, cap: usize) -> ViolationSeverity {
    let observed = observed as f64;
    let cap = cap as f64;
    if observed > 2.0 * cap {
        ViolationSeverity::Critical
    } else if observed > 1.5 * cap {
        ViolationSeverity::High
    } else if observed > 1.2 * cap {
        ViolationSeverity::Medium
    } else {
        ViolationSeverity::Low
    }
}

/// Outcome of a registration check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed,
    Denied { reason: String },
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitOutcome::Allowed)
    }
}

/// Idle time after which a client earns the burst allowance
const BURST_IDLE_THRESHOLD: Duration = Duration::from_secs(30);

/// How long a denial decision is reused without re-evaluating
const DECISION_CACHE_TTL: Duration = Duration::from_secs(5);

/// Violations kept per client
const MAX_VIOLATIONS_PER_CLIENT: usize = 100;

/// Violations older than this are pruned
const VIOLATION_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CachedDenial {
    at: Instant,
    reason: String,
}

/// Rate-limit bookkeeping owned by the session engine
#[derive(Debug)]
pub struct RateLimitState {
    config: RateLimitConfig,

    /// Session-creation timestamps per client, pruned to the window
    client_history: HashMap<String, Vec<Instant>>,

    /// Recorded denials per client
    violations: HashMap<String, Vec<RateLimitViolation>>,

    /// Burst slots granted when a client is seen idle. Charged one by one
    /// above the base cap, so the burst survives its own registrations
    /// resetting the idle clock.
    burst_credits: HashMap<String, usize>,

    /// Denial cache keyed by (client_ip, proxy_name).
    ///
    /// Only denials are cached: a cached allow would let a burst of
    /// registrations inside the TTL sail past the cap.
    denial_cache: HashMap<(String, String), CachedDenial>,
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            client_history: HashMap::new(),
            violations: HashMap::new(),
            burst_credits: HashMap::new(),
            denial_cache: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Evaluate a session registration. On allow the client's history is
    /// charged; on deny a violation is recorded and the decision cached.
    ///
    /// `proxy_sessions` is the caller's count of live sessions already
    /// attached to the proxy.
    pub fn evaluate(
        &mut self,
        client_ip: &str,
        proxy_name: &str,
        proxy_sessions: usize,
        now: Instant,
    ) -> RateLimitOutcome {
        let cache_key = (client_ip.to_string(), proxy_name.to_string());
        if let Some(denial) = self.denial_cache.get(&cache_key) {
            if now.duration_since(denial.at) < DECISION_CACHE_TTL {
                debug!(client_ip, proxy_name, "reusing cached rate-limit denial");
                return RateLimitOutcome::Denied {
                    reason: denial.reason.clone(),
                };
            }
            self.denial_cache.remove(&cache_key);
        }

        self.prune_history(now);

        let history = self.client_history.get(client_ip);
        let client_sessions = history.map(Vec::len).unwrap_or(0);
        let idle = history
            .and_then(|h| h.last())
            .map(|last| now.duration_since(*last))
            .unwrap_or(Duration::MAX);

        // An idle client earns a fresh burst allowance. The credits are
        // consumed one per registration above the base cap, so the whole
        // allowance is usable even though each registration resets the
        // idle clock.
        if self.config.adaptive_scaling && client_sessions > 0 && idle > BURST_IDLE_THRESHOLD {
            self.burst_credits
                .insert(client_ip.to_string(), self.config.burst_allowance);
        }

        let base_cap = self.config.max_sessions_per_client;
        let credits = self.burst_credits.get(client_ip).copied().unwrap_or(0);
        let effective_cap = base_cap + credits;
        if client_sessions >= effective_cap {
            let reason = format!(
                "client {} exceeded rate limit ({}/{} sessions in {}s)",
                client_ip,
                client_sessions,
                effective_cap,
                self.config.session_creation_window.as_secs()
            );
            self.record_denial(
                client_ip,
                proxy_name,
                ViolationKind::ClientLimit,
                severity_for(client_sessions, base_cap),
                &reason,
                now,
            );
            return RateLimitOutcome::Denied { reason };
        }

        if proxy_sessions >= self.config.max_sessions_per_proxy {
            let reason = format!(
                "proxy {} exceeded session limit ({}/{} active sessions)",
                proxy_name, proxy_sessions, self.config.max_sessions_per_proxy
            );
            self.record_denial(
                client_ip,
                proxy_name,
                ViolationKind::ProxyLimit,
                severity_for(proxy_sessions, self.config.max_sessions_per_proxy),
                &reason,
                now,
            );
            return RateLimitOutcome::Denied { reason };
        }

        let warn_at = (self.config.max_sessions_per_client as f64 * self.config.warning_threshold) as usize;
        if client_sessions + 1 >= warn_at.max(1) {
            warn!(
                client_ip,
                sessions = client_sessions + 1,
                cap = self.config.max_sessions_per_client,
                "client approaching session limit"
            );
        }

        self.client_history
            .entry(client_ip.to_string())
            .or_default()
            .push(now);

        RateLimitOutcome::Allowed
    }

    fn record_denial(
        &mut self,
        client_ip: &str,
        proxy_name: &str,
        kind: ViolationKind,
        severity: ViolationSeverity,
        reason: &str,
        now: Instant,
    ) {
        warn!(client_ip, proxy_name, ?kind, ?severity, "session registration denied: {}", reason);

        let violations = self.violations.entry(client_ip.to_string()).or_default();
        violations.push(RateLimitViolation {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            proxy_name: proxy_name.to_string(),
            kind,
            severity,
            details: reason.to_string(),
        });

        let cutoff = Utc::now() - chrono::Duration::from_std(VIOLATION_RETENTION).unwrap_or_default();
        violations.retain(|v| v.timestamp > cutoff);
        if violations.len() > MAX_VIOLATIONS_PER_CLIENT {
            let excess = violations.len() - MAX_VIOLATIONS_PER_CLIENT;
            violations.drain(..excess);
        }

        self.denial_cache.insert(
            (client_ip.to_string(), proxy_name.to_string()),
            CachedDenial {
                at: now,
                reason: reason.to_string(),
            },
        );
    }

    fn prune_history(&mut self, now: Instant) {
        let window = self.config.session_creation_window;
        self.client_history.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) <= window);
            !timestamps.is_empty()
        });
        // Burst credits live only as long as the history that earned them
        let history = &self.client_history;
        self.burst_credits.retain(|client, _| history.contains_key(client));
    }

    /// Recorded violations for one client
    pub fn violations_for(&self, client_ip: &str) -> Vec<RateLimitViolation> {
        self.violations.get(client_ip).cloned().unwrap_or_default()
    }

    /// Clients whose recent session count is at or past the warning
    /// threshold
    pub fn clients_near_limit(&self, now: Instant) -> Vec<(String, usize)> {
        let window = self.config.session_creation_window;
        let warn_at =
            ((self.config.max_sessions_per_client as f64 * self.config.warning_threshold) as usize).max(1);

        self.client_history
            .iter()
            .filter_map(|(client, timestamps)| {
                let recent = timestamps
                    .iter()
                    .filter(|t| now.duration_since(**t) <= window)
                    .count();
                (recent >= warn_at).then(|| (client.clone(), recent))
            })
            .collect()
    }

    /// Drop rate-limit history for one client, or for everyone
    pub fn clear_history(&mut self, client_ip: Option<&str>) -> usize {
        match client_ip {
            Some(client) => {
                self.denial_cache.retain(|(ip, _), _| ip != client);
                self.burst_credits.remove(client);
                usize::from(self.client_history.remove(client).is_some())
            }
            None => {
                let cleared = self.client_history.len();
                self.client_history.clear();
                self.burst_credits.clear();
                self.denial_cache.clear();
                cleared
            }
        }
    }

    /// Number of clients with live history entries
    pub fn tracked_clients(&self) -> usize {
        self.client_history.len()
    }
}
