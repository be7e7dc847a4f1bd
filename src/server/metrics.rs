//! Prometheus metrics for the supervisor
//!
//! Exposes restart and recovery activity:
//! - Restart requests by source, and requests dropped with no target
//! - Generations started
//! - Watchdog probe failures
//! - Worker process exits (expected vs unexpected)

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Supervisor metrics registry
///
/// Clone is cheap (prometheus handles are Arc internally).
#[derive(Clone)]
pub struct SupervisorMetrics {
    registry: Registry,
    /// Restart requests by source (config_change, watchdog, worker_exit, manual)
    pub restart_requests_total: IntCounterVec,
    /// Restart requests that found no active generation
    pub restarts_dropped_total: IntCounter,
    /// Listener generations started
    pub generations_started_total: IntCounter,
    /// Failed health probes
    pub probe_failures_total: IntCounter,
    /// Worker exits by kind (expected, unexpected)
    pub worker_exits_total: IntCounterVec,
}

impl SupervisorMetrics {
    /// Create a new registry with all supervisor metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let restart_requests_total = IntCounterVec::new(
            Opts::new(
                "webwarden_restart_requests_total",
                "Total number of restart requests",
            ),
            &["source"],
        )?;
        registry.register(Box::new(restart_requests_total.clone()))?;

        let restarts_dropped_total = IntCounter::new(
            "webwarden_restarts_dropped_total",
            "Restart requests that fired with no active generation",
        )?;
        registry.register(Box::new(restarts_dropped_total.clone()))?;

        let generations_started_total = IntCounter::new(
            "webwarden_generations_started_total",
            "Listener generations started",
        )?;
        registry.register(Box::new(generations_started_total.clone()))?;

        let probe_failures_total = IntCounter::new(
            "webwarden_probe_failures_total",
            "Health probes that failed while the generation was watched",
        )?;
        registry.register(Box::new(probe_failures_total.clone()))?;

        let worker_exits_total = IntCounterVec::new(
            Opts::new("webwarden_worker_exits_total", "Worker process exits"),
            &["kind"],
        )?;
        registry.register(Box::new(worker_exits_total.clone()))?;

        Ok(Self {
            registry,
            restart_requests_total,
            restarts_dropped_total,
            generations_started_total,
            probe_failures_total,
            worker_exits_total,
        })
    }

    /// Record a restart request from `source`
    pub fn record_restart_request(&self, source: &str) {
        self.restart_requests_total
            .with_label_values(&[source])
            .inc();
    }

    /// Record a restart request that had nothing to interrupt
    pub fn record_restart_dropped(&self) {
        self.restarts_dropped_total.inc();
    }

    pub fn record_generation_started(&self) {
        self.generations_started_total.inc();
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures_total.inc();
    }

    /// Record a worker exit; `expected` is true for supervisor-initiated kills
    pub fn record_worker_exit(&self, expected: bool) {
        let kind = if expected { "expected" } else { "unexpected" };
        self.worker_exits_total.with_label_values(&[kind]).inc();
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<SupervisorMetrics>;

/// Create a new shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(SupervisorMetrics::new()?))
}
