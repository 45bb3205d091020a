//! Metrics collection for the coordination engine.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{MetricType, MetricsCollector};

/// Forwards every metric to whichever `metrics` recorder is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderCollector;

impl RecorderCollector {
    /// Create a new recorder-backed collector
    pub fn new() -> Self {
        Self
    }
}

impl MetricsCollector for RecorderCollector {
    fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: HashMap<String, String>,
    ) {
        let labels: Vec<metrics::Label> = labels
            .into_iter()
            .map(|(k, v)| metrics::Label::new(k, v))
            .collect();

        match metric_type {
            MetricType::Counter => {
                metrics::counter!(name.to_string(), value.max(0.0) as u64, labels)
            }
            MetricType::Gauge => metrics::gauge!(name.to_string(), value, labels),
            MetricType::Histogram => metrics::histogram!(name.to_string(), value, labels),
        }
    }
}

/// A metric captured by [`MemoryCollector`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    /// Metric name
    pub name: String,
    /// Recorded value
    pub value: f64,
    /// Kind of metric
    pub metric_type: MetricType,
    /// Labels attached to the observation
    pub labels: HashMap<String, String>,
}

/// Keeps every observation in memory, useful for tests and inspection.
#[derive(Debug, Default)]
pub struct MemoryCollector {
    recorded: Mutex<Vec<RecordedMetric>>,
}

impl MemoryCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// All observations in recording order
    pub fn snapshot(&self) -> Vec<RecordedMetric> {
        self.recorded.lock().clone()
    }

    /// Sum of all counter observations with the given name
    pub fn counter_total(&self, name: &str) -> f64 {
        self.recorded
            .lock()
            .iter()
            .filter(|m| m.name == name && m.metric_type == MetricType::Counter)
            .map(|m| m.value)
            .sum()
    }
}

impl MetricsCollector for MemoryCollector {
    fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: HashMap<String, String>,
    ) {
        self.recorded.lock().push(RecordedMetric {
            name: name.to_string(),
            value,
            metric_type,
            labels,
        });
    }
}

/// Metric names emitted by the engine
pub mod names {
    /// Sessions finished, labelled by outcome
    pub const SESSIONS_TOTAL: &str = "tandem_sessions_total";
    /// Session latency in milliseconds
    pub const SESSION_LATENCY_MS: &str = "tandem_session_latency_ms";
    /// Role phases finished, labelled by role and outcome
    pub const PHASES_TOTAL: &str = "tandem_phases_total";
    /// Phase latency in milliseconds
    pub const PHASE_LATENCY_MS: &str = "tandem_phase_latency_ms";
    /// Retry attempts scheduled by the resilient executor
    pub const RETRIES_TOTAL: &str = "tandem_retries_total";
    /// Boundary violations detected
    pub const BOUNDARY_VIOLATIONS_TOTAL: &str = "tandem_boundary_violations_total";
    /// Circuit breakers tripped open
    pub const CIRCUITS_OPENED_TOTAL: &str = "tandem_circuits_opened_total";
    /// Current backlog depth
    pub const BACKLOG_DEPTH: &str = "tandem_backlog_depth";
}

/// Coordination specific metrics
#[derive(Clone)]
pub struct CoordinationMetrics {
    collector: Arc<dyn MetricsCollector>,
}

impl std::fmt::Debug for CoordinationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationMetrics").finish_non_exhaustive()
    }
}

impl CoordinationMetrics {
    /// Wrap a collector
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self { collector }
    }

    /// Record a finished session
    pub fn record_session(&self, success: bool, latency_ms: f64) {
        debug!("Session finished: success={}, latency={}ms", success, latency_ms);
        let labels = outcome_labels(success);
        self.collector
            .record_metric(names::SESSIONS_TOTAL, 1.0, MetricType::Counter, labels.clone());
        self.collector
            .record_metric(names::SESSION_LATENCY_MS, latency_ms, MetricType::Histogram, labels);
    }

    /// Record a finished role phase
    pub fn record_phase(&self, role: &str, success: bool, duration_ms: f64) {
        debug!("Phase finished: role={}, success={}, duration={}ms", role, success, duration_ms);
        let mut labels = outcome_labels(success);
        labels.insert("role".to_string(), role.to_string());
        self.collector
            .record_metric(names::PHASES_TOTAL, 1.0, MetricType::Counter, labels.clone());
        self.collector
            .record_metric(names::PHASE_LATENCY_MS, duration_ms, MetricType::Histogram, labels);
    }

    /// Record a scheduled retry
    pub fn record_retry(&self, role: &str, operation: &str, code: &str) {
        let labels = HashMap::from([
            ("role".to_string(), role.to_string()),
            ("operation".to_string(), operation.to_string()),
            ("code".to_string(), code.to_string()),
        ]);
        self.collector.increment(names::RETRIES_TOTAL, labels);
    }

    /// Record a boundary violation
    pub fn record_boundary_violation(&self, role: &str) {
        let labels = HashMap::from([("role".to_string(), role.to_string())]);
        self.collector.increment(names::BOUNDARY_VIOLATIONS_TOTAL, labels);
    }

    /// Record a circuit breaker tripping open
    pub fn record_circuit_opened(&self, key: &str) {
        let labels = HashMap::from([("circuit".to_string(), key.to_string())]);
        self.collector.increment(names::CIRCUITS_OPENED_TOTAL, labels);
    }

    /// Record the current backlog depth
    pub fn record_backlog_depth(&self, depth: usize) {
        self.collector
            .record_metric(names::BACKLOG_DEPTH, depth as f64, MetricType::Gauge, HashMap::new());
    }
}

impl Default for CoordinationMetrics {
    fn default() -> Self {
        Self::new(Arc::new(RecorderCollector::new()))
    }
}

fn outcome_labels(success: bool) -> HashMap<String, String> {
    let outcome = if success { "success" } else { "failure" };
    HashMap::from([("outcome".to_string(), outcome.to_string())])
}
