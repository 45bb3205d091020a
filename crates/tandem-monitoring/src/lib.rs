//! Monitoring module for the Tandem coordination engine.
//!
//! Provides structured logging setup (tracing-subscriber) and a small
//! metrics collection interface backed by the `metrics` crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

pub mod logging;
pub mod metrics;

/// Type of metric for collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    /// Counter metrics accumulate values
    Counter,
    /// Gauge metrics record current values
    Gauge,
    /// Histogram metrics observe distributions
    Histogram,
}

/// Interface for collecting metrics
pub trait MetricsCollector: Send + Sync {
    /// Record a metric with the given name, value, type, and labels
    fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: HashMap<String, String>,
    );

    /// Increment a counter by one
    fn increment(&self, name: &str, labels: HashMap<String, String>) {
        self.record_metric(name, 1.0, MetricType::Counter, labels);
    }
}

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Log level filter (e.g., "info,tandem_core=debug")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Emit JSON formatted logs instead of the pretty format
    #[serde(default)]
    pub enable_json_logging: bool,
    /// Forward metrics to the installed `metrics` recorder
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_service_name() -> String {
    "tandem".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_enable_metrics() -> bool {
    true
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
            enable_metrics: default_enable_metrics(),
            environment: default_environment(),
        }
    }
}

/// Initialize monitoring system
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(config)?;
    info!(
        service_name = %config.service_name,
        environment = %config.environment,
        metrics = config.enable_metrics,
        "Monitoring initialized"
    );
    Ok(())
}

pub use crate::logging::{init_logging, init_test_tracing, LogExt};
pub use crate::metrics::{CoordinationMetrics, MemoryCollector, RecorderCollector};
