//! # Application State
//!
//! Shared by every HTTP handler and WebSocket session:
//!
//! - **config**: immutable after startup, so a plain `Arc` is enough
//! - **metrics**: request counters updated by the telemetry middleware, behind
//!   `Arc<RwLock<_>>` because every request writes to them
//! - **orchestrator**: the turn pipeline; stateless per session, so it is shared
//! - **weather**: the weather lookup client
//!
//! Live WebSocket sessions are counted through [`SessionSlot`], an RAII guard:
//! the count goes down when the slot is dropped, however the session ends.

use crate::config::AppConfig;
use crate::pipeline::TurnOrchestrator;
use crate::weather::WeatherClient;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub weather: Arc<WeatherClient>,
    pub start_time: Instant,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// HTTP requests handled since startup
    pub request_count: u64,
    /// Requests that ended in a 4xx/5xx or a handler error
    pub error_count: u64,
    /// Open `/ws/chat` connections
    pub active_sessions: usize,
    /// Sessions opened since startup
    pub total_sessions: u64,
    /// Connections turned away because the server was full
    pub rejected_sessions: u64,
    /// Keyed by `"<METHOD> <path>"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// A reserved place for one WebSocket session.
pub struct SessionSlot {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let mut metrics = write_metrics(&self.metrics);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

// A panic while holding the lock leaves the counters usable, so recover the guard.
fn read_metrics(lock: &RwLock<AppMetrics>) -> RwLockReadGuard<'_, AppMetrics> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_metrics(lock: &RwLock<AppMetrics>) -> RwLockWriteGuard<'_, AppMetrics> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, orchestrator: Arc<TurnOrchestrator>, weather: Arc<WeatherClient>) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            orchestrator,
            weather,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn increment_request_count(&self) {
        write_metrics(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write_metrics(&self.metrics).error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write_metrics(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a session slot, or `None` when `max_concurrent_sessions` are open.
    pub fn try_open_session(&self) -> Option<SessionSlot> {
        let limit = self.config.performance.max_concurrent_sessions;
        let mut metrics = write_metrics(&self.metrics);
        if metrics.active_sessions >= limit {
            metrics.rejected_sessions += 1;
            return None;
        }
        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        Some(SessionSlot {
            metrics: Arc::clone(&self.metrics),
        })
    }

    #[cfg(test)]
    pub fn active_sessions(&self) -> usize {
        read_metrics(&self.metrics).active_sessions
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read_metrics(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
