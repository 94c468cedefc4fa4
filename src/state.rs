//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every relay session.
//!
//! ## What is shared:
//! - **config**: immutable after startup, so a plain `Arc` is enough
//! - **metrics**: counters written by the HTTP middleware and by relay
//!   sessions, read by the metrics endpoint
//!
//! Sessions only ever *write* metrics; no relay decision depends on them, so
//! sessions stay independent of each other.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and sessions hold a reference
//! - **RwLock**: many readers OR one writer
//! - Lock poisoning is recovered from: a panicked writer leaves counters that
//!   are still perfectly usable.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration, loaded once
    pub config: Arc<AppConfig>,

    /// HTTP and relay counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and relay sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors (4xx/5xx) since server start
    pub error_count: u64,

    /// Detailed metrics for each HTTP endpoint, keyed like "GET /health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub relay: RelayMetrics,
}

/// Relay-side counters.
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    /// Sessions currently pumping messages
    pub active_sessions: u32,

    /// Sessions started since server start
    pub total_sessions: u64,

    /// Sessions that ended because of a RelayError
    pub failed_sessions: u64,

    /// Upgrade requests dropped by the router
    pub rejected_upgrades: u64,

    /// Upgrades refused because no credential is configured
    pub refused_missing_credential: u64,

    pub messages_to_upstream: u64,
    pub bytes_to_upstream: u64,
    pub messages_to_client: u64,
    pub bytes_to_client: u64,
}

/// Detailed performance metrics for a specific HTTP endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Direction of a relayed message, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToUpstream,
    ToClient,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by middleware for every HTTP request.
    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time we see an endpoint, a zeroed EndpointMetric is created.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn session_started(&self) {
        let mut metrics = self.write_metrics();
        metrics.relay.active_sessions += 1;
        metrics.relay.total_sessions += 1;
    }

    /// Underflow-safe: a session that ends twice must not wrap the gauge.
    pub fn session_ended(&self, failed: bool) {
        let mut metrics = self.write_metrics();
        if metrics.relay.active_sessions > 0 {
            metrics.relay.active_sessions -= 1;
        }
        if failed {
            metrics.relay.failed_sessions += 1;
        }
    }

    pub fn record_rejected_upgrade(&self) {
        self.write_metrics().relay.rejected_upgrades += 1;
    }

    pub fn record_missing_credential(&self) {
        self.write_metrics().relay.refused_missing_credential += 1;
    }

    pub fn record_relayed(&self, direction: Direction, bytes: usize) {
        let mut metrics = self.write_metrics();
        let bytes = bytes as u64;
        match direction {
            Direction::ToUpstream => {
                metrics.relay.messages_to_upstream += 1;
                metrics.relay.bytes_to_upstream += bytes;
            }
            Direction::ToClient => {
                metrics.relay.messages_to_client += 1;
                metrics.relay.bytes_to_client += bytes;
            }
        }
    }

    /// A consistent copy of all counters, taken under one read lock so the
    /// endpoint never holds the lock while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_gauge_never_underflows() {
        let state = AppState::new(AppConfig::default());
        state.session_started();
        state.session_ended(false);
        state.session_ended(true);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.relay.active_sessions, 0);
        assert_eq!(metrics.relay.total_sessions, 1);
        assert_eq!(metrics.relay.failed_sessions, 1);
    }

    #[test]
    fn test_relayed_accounting_per_direction() {
        let state = AppState::new(AppConfig::default());
        state.record_relayed(Direction::ToUpstream, 10);
        state.record_relayed(Direction::ToUpstream, 5);
        state.record_relayed(Direction::ToClient, 7);

        let relay = state.get_metrics_snapshot().relay;
        assert_eq!(relay.messages_to_upstream, 2);
        assert_eq!(relay.bytes_to_upstream, 15);
        assert_eq!(relay.messages_to_client, 1);
        assert_eq!(relay.bytes_to_client, 7);
    }

    #[test]
    fn test_endpoint_metric_rates() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 4, false);
        state.record_endpoint_request("GET /health", 6, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 5.0);
        assert_eq!(health.error_rate(), 0.5);
        assert_eq!(EndpointMetric::default().error_rate(), 0.0);
    }
}
