//! Per-session heartbeat metrics and adaptive interval computation
//!
//! Every live SSE stream emits periodic ping frames. The manager records
//! their outcomes, keeps a rolling window of response-time samples, and
//! stretches the ping interval when a session is erroring, slow, or the
//! host is under load.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use gateway_config::HeartbeatConfig;

/// Response-time samples kept per session
const RESPONSE_TIME_WINDOW: usize = 100;

/// Heartbeat bookkeeping for one session
#[derive(Debug, Clone, Default)]
pub struct HeartbeatMetrics {
    pub total_heartbeats: u64,
    pub successful_heartbeats: u64,
    pub failed_heartbeats: u64,
    pub average_response_time_ms: f64,
    pub error_rate_percent: f64,
    pub last_heartbeat: Option<Instant>,
    response_times: VecDeque<f64>,
}

impl HeartbeatMetrics {
    /// Record one heartbeat attempt
    pub fn record(&mut self, success: bool, response_time_ms: f64) {
        self.total_heartbeats += 1;
        self.last_heartbeat = Some(Instant::now());

        if success {
            self.successful_heartbeats += 1;
            if response_time_ms > 0.0 {
                if self.response_times.len() == RESPONSE_TIME_WINDOW {
                    self.response_times.pop_front();
                }
                self.response_times.push_back(response_time_ms);
                self.average_response_time_ms =
                    self.response_times.iter().sum::<f64>() / self.response_times.len() as f64;
            }
        } else {
            self.failed_heartbeats += 1;
        }

        self.error_rate_percent = (self.failed_heartbeats as f64 / self.total_heartbeats as f64) * 100.0;
    }

    pub fn sample_count(&self) -> usize {
        self.response_times.len()
    }
}

/// Aggregate view across all sessions
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatOverview {
    pub total_sessions: usize,
    pub total_heartbeats: u64,
    pub successful_heartbeats: u64,
    pub failed_heartbeats: u64,
    pub overall_success_rate: f64,
    pub average_response_time_ms: f64,
    pub sessions_with_issues: usize,
}

/// Owner of every session's heartbeat metrics
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    metrics: Mutex<HashMap<String, HeartbeatMetrics>>,
}

impl HeartbeatManager {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Record one heartbeat for a session
    pub fn record_heartbeat(&self, session_id: &str, success: bool, response_time_ms: f64) {
        let mut metrics = self.metrics.lock().expect("heartbeat metrics lock");
        let entry = metrics.entry(session_id.to_string()).or_default();
        entry.record(success, response_time_ms);

        if response_time_ms > self.config.response_time_threshold_ms {
            warn!(
                session_id,
                response_time_ms, "slow heartbeat response"
            );
        }
    }

    /// Current metrics snapshot for one session
    pub fn metrics_for(&self, session_id: &str) -> Option<HeartbeatMetrics> {
        let metrics = self.metrics.lock().expect("heartbeat metrics lock");
        metrics.get(session_id).cloned()
    }

    /// The interval until a session's next ping:
    ///
    /// ```text
    /// base := configured interval
    /// if error_rate  > threshold: base *= 1.5
    /// if avg latency > threshold: base *= 1.2
    /// if system load > 0.8:       base *= 1.3
    /// clamp(base, min_interval, max_interval)
    /// ```
    pub fn adaptive_interval(&self, session_id: &str, system_load: f64) -> Duration {
        if !self.config.adaptive_enabled {
            return self.config.interval;
        }

        let metrics = self
            .metrics_for(session_id)
            .unwrap_or_default();

        let mut base = self.config.interval.as_secs_f64();

        if self.config.error_based_adjustment
            && metrics.error_rate_percent > self.config.error_rate_threshold_percent
        {
            base *= 1.5;
        }
        if metrics.average_response_time_ms > self.config.response_time_threshold_ms {
            base *= 1.2;
        }
        if self.config.load_based_adjustment && system_load > 0.8 {
            base *= 1.3;
        }

        Duration::from_secs_f64(base.clamp(
            self.config.min_interval.as_secs_f64(),
            self.config.max_interval.as_secs_f64(),
        ))
    }

    /// Drop metrics when a session goes away
    pub fn remove_session(&self, session_id: &str) {
        let mut metrics = self.metrics.lock().expect("heartbeat metrics lock");
        metrics.remove(session_id);
    }

    /// Aggregate metrics across every live session
    pub fn overall_metrics(&self) -> HeartbeatOverview {
        let metrics = self.metrics.lock().expect("heartbeat metrics lock");

        let total_heartbeats: u64 = metrics.values().map(|m| m.total_heartbeats).sum();
        let successful: u64 = metrics.values().map(|m| m.successful_heartbeats).sum();
        let failed: u64 = metrics.values().map(|m| m.failed_heartbeats).sum();

        let mut total_response_time = 0.0;
        let mut total_samples = 0usize;
        let mut sessions_with_issues = 0usize;

        for m in metrics.values() {
            total_response_time += m.response_times.iter().sum::<f64>();
            total_samples += m.response_times.len();

            if m.error_rate_percent > self.config.error_rate_threshold_percent
                || m.average_response_time_ms > self.config.response_time_threshold_ms
            {
                sessions_with_issues += 1;
            }
        }

        HeartbeatOverview {
            total_sessions: metrics.len(),
            total_heartbeats,
            successful_heartbeats: successful,
            failed_heartbeats: failed,
            overall_success_rate: if total_heartbeats > 0 {
                successful as f64 / total_heartbeats as f64 * 100.0
            } else {
                100.0
            },
            average_response_time_ms: if total_samples > 0 {
                total_response_time / total_samples as f64
            } else {
                0.0
            },
            sessions_with_issues,
        }
    }
}

/// One-minute load average normalized by core count, used for load-based
/// interval stretching. Returns 0.0 where the platform offers no load
/// average.
pub fn system_load() -> f64 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;
    let load = sysinfo::System::load_average().one;
    if load.is_finite() && load >= 0.0 {
        load / cores
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> HeartbeatManager {
        HeartbeatManager::new(HeartbeatConfig::default())
    }

    #[test]
    fn test_metrics_rolling_window() {
        let mut metrics = HeartbeatMetrics::default();
        for i in 0..150 {
            metrics.record(true, (i + 1) as f64);
        }
        // Only the last 100 samples survive: 51..=150 averages to 100.5
        assert_eq!(metrics.sample_count(), RESPONSE_TIME_WINDOW);
        assert!((metrics.average_response_time_ms - 100.5).abs() < f64::EPSILON);
        assert_eq!(metrics.total_heartbeats, 150);
    }

    #[test]
    fn test_error_rate_tracking() {
        let mut metrics = HeartbeatMetrics::default();
        metrics.record(true, 10.0);
        metrics.record(false, 0.0);
        metrics.record(false, 0.0);
        metrics.record(true, 10.0);
        assert!((metrics.error_rate_percent - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_adaptive_interval_baseline() {
        let manager = manager();
        // A fresh session with no metrics pings at the configured interval
        assert_eq!(
            manager.adaptive_interval("s", 0.0),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_adaptive_interval_stretches_on_errors() {
        let manager = manager();
        for _ in 0..9 {
            manager.record_heartbeat("s", false, 0.0);
        }
        manager.record_heartbeat("s", true, 10.0);

        // error rate 90% > 5% threshold: 10s * 1.5 = 15s
        assert_eq!(manager.adaptive_interval("s", 0.0), Duration::from_secs(15));
    }

    #[test]
    fn test_adaptive_interval_stretches_on_latency_and_load() {
        let manager = manager();
        manager.record_heartbeat("s", true, 2000.0);

        // latency factor 1.2: ~12s; plus load factor 1.3: ~15.6s
        let latency_only = manager.adaptive_interval("s", 0.0).as_secs_f64();
        assert!((latency_only - 12.0).abs() < 0.01, "got {}", latency_only);

        let with_load = manager.adaptive_interval("s", 0.9).as_secs_f64();
        assert!((with_load - 15.6).abs() < 0.01, "got {}", with_load);
    }

    #[test]
    fn test_adaptive_interval_clamped_to_max() {
        let manager = manager();
        for _ in 0..9 {
            manager.record_heartbeat("s", false, 0.0);
        }
        manager.record_heartbeat("s", true, 2000.0);

        // 10 * 1.5 * 1.2 * 1.3 = ~23.4s, still under the 30s cap
        let interval = manager.adaptive_interval("s", 0.9).as_secs_f64();
        assert!(interval <= 30.0);
        assert!((interval - 23.4).abs() < 0.01, "got {}", interval);
    }

    #[test]
    fn test_adaptive_disabled_uses_base_interval() {
        let manager = HeartbeatManager::new(HeartbeatConfig {
            adaptive_enabled: false,
            ..Default::default()
        });
        for _ in 0..10 {
            manager.record_heartbeat("s", false, 0.0);
        }
        assert_eq!(manager.adaptive_interval("s", 1.0), Duration::from_secs(10));
    }

    #[test]
    fn test_remove_session_and_overview() {
        let manager = manager();
        manager.record_heartbeat("a", true, 5.0);
        manager.record_heartbeat("b", false, 0.0);

        let overview = manager.overall_metrics();
        assert_eq!(overview.total_sessions, 2);
        assert_eq!(overview.total_heartbeats, 2);
        assert!((overview.overall_success_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(overview.sessions_with_issues, 1);

        manager.remove_session("a");
        manager.remove_session("b");
        let overview = manager.overall_metrics();
        assert_eq!(overview.total_sessions, 0);
        assert!((overview.overall_success_rate - 100.0).abs() < f64::EPSILON);
    }
}
