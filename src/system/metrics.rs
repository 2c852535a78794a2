//! Metrics collection and monitoring for the repository server
//!
//! This module provides metrics collection using Prometheus, registered in a
//! crate-wide registry and rendered with [`collect_metrics`].

use crate::core::error::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry, register_int_gauge_with_registry,
    Histogram, IntCounter, IntGauge, Registry,
};
use std::time::Instant;

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Commit and load counters of the repository
pub struct RepositoryMetrics {
    /// Total number of successful commits
    pub commits: IntCounter,
    /// Total number of commits rejected because a base version was stale
    pub commit_conflicts: IntCounter,
    /// Total number of commits that failed for other reasons
    pub commits_failed: IntCounter,
    /// Histogram of commit durations in seconds
    pub commit_duration: Histogram,
    /// Total number of revisions loaded from the store
    pub revisions_loaded: IntCounter,
    /// Total number of list chunks loaded from the store
    pub chunks_loaded: IntCounter,
}

/// Session and notification counters
pub struct SessionMetrics {
    /// Total number of sessions opened
    pub sessions_opened: IntCounter,
    /// Total number of sessions closed
    pub sessions_closed: IntCounter,
    /// Number of open sessions
    pub active_sessions: IntGauge,
    /// Total number of views opened
    pub views_opened: IntCounter,
    /// Total number of invalidation events sent to sessions
    pub invalidations_sent: IntCounter,
}

/// Network metrics for the TCP transport
pub struct NetworkMetrics {
    /// Total number of connections accepted
    pub connections_accepted: IntCounter,
    /// Total number of frames received
    pub frames_received: IntCounter,
    /// Total number of frames sent
    pub frames_sent: IntCounter,
    /// Total number of protocol violations
    pub protocol_errors: IntCounter,
}

/// Centralized metrics collection for all system components
pub struct Metrics {
    /// Repository commit and load metrics
    pub repository: RepositoryMetrics,
    /// Session metrics
    pub sessions: SessionMetrics,
    /// Network communication metrics
    pub network: NetworkMetrics,
}

impl Metrics {
    /// Create and register a new metrics instance
    pub fn new() -> Result<Self> {
        Ok(Self {
            repository: RepositoryMetrics::new()?,
            sessions: SessionMetrics::new()?,
            network: NetworkMetrics::new()?,
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> = Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
        &INSTANCE
    }
}

impl RepositoryMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            commits: register_int_counter_with_registry!(
                "cdo_commits_total",
                "Total number of successful commits",
                REGISTRY
            )?,
            commit_conflicts: register_int_counter_with_registry!(
                "cdo_commit_conflicts_total",
                "Total number of commits rejected with a conflict",
                REGISTRY
            )?,
            commits_failed: register_int_counter_with_registry!(
                "cdo_commits_failed_total",
                "Total number of commits failed for other reasons",
                REGISTRY
            )?,
            commit_duration: register_histogram_with_registry!(
                "cdo_commit_duration_seconds",
                "Duration of commits in seconds",
                vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
                REGISTRY
            )?,
            revisions_loaded: register_int_counter_with_registry!(
                "cdo_revisions_loaded_total",
                "Total number of revisions loaded",
                REGISTRY
            )?,
            chunks_loaded: register_int_counter_with_registry!(
                "cdo_chunks_loaded_total",
                "Total number of list chunks loaded",
                REGISTRY
            )?,
        })
    }
}

impl SessionMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            sessions_opened: register_int_counter_with_registry!(
                "cdo_sessions_opened_total",
                "Total number of sessions opened",
                REGISTRY
            )?,
            sessions_closed: register_int_counter_with_registry!(
                "cdo_sessions_closed_total",
                "Total number of sessions closed",
                REGISTRY
            )?,
            active_sessions: register_int_gauge_with_registry!(
                "cdo_active_sessions",
                "Number of open sessions",
                REGISTRY
            )?,
            views_opened: register_int_counter_with_registry!(
                "cdo_views_opened_total",
                "Total number of views opened",
                REGISTRY
            )?,
            invalidations_sent: register_int_counter_with_registry!(
                "cdo_invalidations_sent_total",
                "Total number of invalidation events sent",
                REGISTRY
            )?,
        })
    }
}

impl NetworkMetrics {
    fn new() -> Result<Self> {
        Ok(Self {
            connections_accepted: register_int_counter_with_registry!(
                "cdo_connections_accepted_total",
                "Total connections accepted",
                REGISTRY
            )?,
            frames_received: register_int_counter_with_registry!(
                "cdo_frames_received_total",
                "Total frames received",
                REGISTRY
            )?,
            frames_sent: register_int_counter_with_registry!(
                "cdo_frames_sent_total",
                "Total frames sent",
                REGISTRY
            )?,
            protocol_errors: register_int_counter_with_registry!(
                "cdo_protocol_errors_total",
                "Total protocol violations",
                REGISTRY
            )?,
        })
    }
}

/// Timer for measuring operation duration with automatic histogram recording
pub struct Timer {
    start: Instant,
    histogram: Histogram,
}

impl Timer {
    /// Start a new timer
    pub fn start(histogram: Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    /// Record the elapsed time and consume the timer
    pub fn finish(self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Time an expression and record its duration in a histogram
#[macro_export]
macro_rules! time_operation {
    ($metric:expr, $body:expr) => {{
        let timer = $crate::system::metrics::Timer::start($metric.clone());
        let result = $body;
        timer.finish();
        result
    }};
}

/// Register every metric by creating the global metrics instance
pub fn init_registry() {
    let _ = Metrics::global();
}

/// Prometheus registry holding every metric of this crate
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Collect and return all metrics as a Prometheus-formatted string
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry().gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_metrics() {
        init_registry();
        Metrics::global().repository.commits.inc();
        let text = collect_metrics();
        assert!(text.contains("cdo_commits_total"));
        assert!(text.contains("cdo_active_sessions"));
    }

    #[test]
    fn timer_records_observation() {
        let histogram = Histogram::with_opts(prometheus::HistogramOpts::new("timer_test", "timer test")).unwrap();
        let value = time_operation!(histogram, 2 + 2);
        assert_eq!(value, 4);
        assert_eq!(histogram.get_sample_count(), 1);
    }
}
