//! # Application State Management
//!
//! This module holds everything shared between the HTTP handlers, the WebSocket
//! actors and the background sweeper.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many handlers and actors share ownership of the same data
//! - **Why needed**: actix-web runs one app instance per worker thread, and every
//!   WebSocket connection is its own actor; all of them need the same session table
//!
//! ### RwLock for metrics
//! - Counters are bumped from many connections at once, and read by `/api/v1/metrics`
//! - Every critical section is a single increment, so contention stays low
//!
//! ## What lives where:
//! - **config**: immutable after startup, so a plain `Arc<AppConfig>`
//! - **sessions**: the `SessionManager` does its own fine-grained locking
//! - **metrics**: `Arc<RwLock<AppMetrics>>`, the same pattern used for counters everywhere

use crate::audio::session::{SessionManager, SessionSettings};
use crate::config::AppConfig;
use crate::detection::InferenceEngine;
use crate::error::SessionError;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all handlers.
///
/// ## Thread Safety Pattern:
/// Cloning `AppState` only clones `Arc`s, so every worker and every connection sees
/// the same sessions and the same counters.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed at startup
    pub config: Arc<AppConfig>,

    /// All live detection sessions
    pub sessions: Arc<SessionManager>,

    /// Counters collected across all connections
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
///
/// ## Why these metrics matter:
/// - **connections_opened / refused**: load and capacity planning
/// - **frames_processed**: throughput
/// - **frames_rejected / inference_failures**: client and engine health
/// - **frames_dropped**: clients sending faster than inference keeps up
/// - **sessions_evicted**: clients that vanished without closing
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct AppMetrics {
    pub connections_opened: u64,
    pub connections_refused: u64,
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub inference_failures: u64,
    pub frames_dropped: u64,
    pub sessions_evicted: u64,
}

impl AppMetrics {
    /// Fraction of submitted frames that failed for any reason (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        let failed = self.frames_rejected + self.inference_failures + self.frames_dropped;
        let total = self.frames_processed + failed;
        if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    /// Create the shared state and the session manager around `engine`.
    pub fn new(config: AppConfig, engine: Arc<dyn InferenceEngine>) -> Self {
        let sessions = SessionManager::new(engine, SessionSettings::from_config(&config));
        Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.as_ref().clone()
    }

    // Counters stay meaningful after a panicking writer, so poisoning is ignored
    fn update_metrics(&self, update: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }

    pub fn record_connection_opened(&self) {
        self.update_metrics(|m| m.connections_opened += 1);
    }

    pub fn record_connection_refused(&self) {
        self.update_metrics(|m| m.connections_refused += 1);
    }

    pub fn record_frame_processed(&self) {
        self.update_metrics(|m| m.frames_processed += 1);
    }

    /// Count a failed frame under the counter matching its error.
    ///
    /// `UnknownSession` is not counted: it only happens after the session is gone.
    pub fn record_frame_error(&self, err: &SessionError) {
        match err {
            SessionError::InvalidFrame(_) => self.update_metrics(|m| m.frames_rejected += 1),
            SessionError::InferenceFailure(_) => {
                self.update_metrics(|m| m.inference_failures += 1)
            }
            SessionError::Overloaded(_) => self.update_metrics(|m| m.frames_dropped += 1),
            _ => {}
        }
    }

    pub fn record_sessions_evicted(&self, count: usize) {
        if count > 0 {
            self.update_metrics(|m| m.sessions_evicted += count as u64);
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning releases the lock before the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::EnergyEngine;

    fn state() -> AppState {
        let config = AppConfig::default();
        let engine = Arc::new(EnergyEngine::from_config(&config.detection));
        AppState::new(config, engine)
    }

    #[test]
    fn test_frame_errors_are_counted_by_kind() {
        let state = state();
        state.record_frame_processed();
        state.record_frame_error(&SessionError::InvalidFrame("empty".into()));
        state.record_frame_error(&SessionError::InferenceFailure("boom".into()));
        state.record_frame_error(&SessionError::Overloaded(32));
        state.record_frame_error(&SessionError::UnknownSession("gone".into()));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.frames_processed, 1);
        assert_eq!(metrics.frames_rejected, 1);
        assert_eq!(metrics.inference_failures, 1);
        assert_eq!(metrics.frames_dropped, 1);
        assert!((metrics.failure_rate() - 3.0 / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_clones_share_sessions_and_metrics() {
        let state = state();
        let other = state.clone();

        other.record_connection_opened();
        other.record_sessions_evicted(0);
        other.record_sessions_evicted(2);
        other.sessions.on_connect("shared").unwrap();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.connections_opened, 1);
        assert_eq!(metrics.sessions_evicted, 2);
        assert_eq!(state.sessions.session_count(), 1);
    }

    #[test]
    fn test_empty_metrics_have_zero_failure_rate() {
        assert_eq!(AppMetrics::default().failure_rate(), 0.0);
    }
}
