//! Configuration for the coordination engine
//!
//! Every field has a default, so an empty configuration is valid. Values are
//! layered from an optional file and `TANDEM__*` environment variables
//! (`TANDEM__RETRY__MAX_ATTEMPTS=5`, `TANDEM__COORDINATOR__EXECUTION_TIMEOUT_MS=60000`).

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::resilience::{CircuitBreakerConfig, RecoveryConfig, RetryPolicy};
use crate::{CoreError, CoreResult};
use tandem_monitoring::{LogExt, MonitoringConfig};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the admission tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Priority of a request without hints
    #[serde(default = "default_base_priority")]
    pub base_priority: i32,

    /// Adjustment applied for `priority = high|low`
    #[serde(default = "default_priority_step")]
    pub priority_step: i32,
}

fn default_tick_interval_ms() -> u64 { 1000 }
fn default_base_priority() -> i32 { 50 }
fn default_priority_step() -> i32 { 20 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            base_priority: default_base_priority(),
            priority_step: default_priority_step(),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Wall-clock budget of one execution call
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Wall-clock budget of one planning call; unset means unbounded
    #[serde(default)]
    pub planning_timeout_ms: Option<u64>,

    /// Return errored roles to idle after a failed session
    #[serde(default = "default_true")]
    pub auto_reset_actors: bool,

    /// Check collaborator entry points against the forbidden verbs
    #[serde(default = "default_true")]
    pub enforce_capability_guard: bool,
}

fn default_execution_timeout_ms() -> u64 { 300_000 }
fn default_true() -> bool { true }

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: default_execution_timeout_ms(),
            planning_timeout_ms: None,
            auto_reset_actors: true,
            enforce_capability_guard: true,
        }
    }
}

/// Top level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Coordinator settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Retry policy for collaborator calls
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,

    /// Recovery strategies
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Logging and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TANDEM";

impl EngineConfig {
    /// Load from an optional file (any format the `config` crate knows) and
    /// the environment; the environment wins.
    pub fn load(path: Option<&str>) -> CoreResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .log_err("Failed to read engine configuration")?;
        config.validate().log_err("Invalid engine configuration")?;

        info!(
            tick_interval_ms = config.scheduler.tick_interval_ms,
            max_attempts = config.retry.max_attempts,
            failure_threshold = config.circuit.failure_threshold,
            "Engine configuration loaded"
        );
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> CoreResult<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "scheduler.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::ConfigurationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(CoreError::ConfigurationError(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(CoreError::ConfigurationError(
                "retry.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(CoreError::ConfigurationError(
                "circuit.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.coordinator.execution_timeout_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "coordinator.execution_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
