use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One of the two mutually exclusive roles a request passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Produces instructions, never acts on them
    Planning,
    /// Carries out instructions, never decides them
    Execution,
}

impl ActorRole {
    /// Both roles
    pub const ALL: [ActorRole; 2] = [ActorRole::Planning, ActorRole::Execution];

    /// The other role
    pub fn opposite(self) -> Self {
        match self {
            ActorRole::Planning => ActorRole::Execution,
            ActorRole::Execution => ActorRole::Planning,
        }
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::Planning => "planning",
            ActorRole::Execution => "execution",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness of a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    /// Ready for work
    Idle,
    /// Running an operation
    Busy,
    /// Last operation failed; needs a reset
    Error,
}

impl fmt::Display for ActorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActorStatus::Idle => "idle",
            ActorStatus::Busy => "busy",
            ActorStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Running counters for a role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorMetrics {
    /// Operations finished
    pub total_operations: u64,
    /// Operations that succeeded
    pub successful_operations: u64,
    /// Operations that failed
    pub failed_operations: u64,
    /// Mean latency over all finished operations
    pub average_latency_ms: f64,
}

impl ActorMetrics {
    fn record(&mut self, success: bool, latency_ms: u64) {
        self.total_operations += 1;
        if success {
            self.successful_operations += 1;
        } else {
            self.failed_operations += 1;
        }
        let n = self.total_operations as f64;
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / n;
    }
}

/// State of one role, owned by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    /// Unique identifier
    pub id: String,
    /// Role this state belongs to
    pub role: ActorRole,
    /// Current status
    pub status: ActorStatus,
    /// Operation being run while busy
    pub current_operation: Option<String>,
    /// Last time the status changed
    pub last_activity: DateTime<Utc>,
    /// Message of the last failure
    pub last_error: Option<String>,
    /// Counters
    pub metrics: ActorMetrics,
}

impl ActorState {
    /// Fresh idle state for a role
    pub fn new(role: ActorRole) -> Self {
        Self {
            id: format!("{}-{}", role, Uuid::new_v4()),
            role,
            status: ActorStatus::Idle,
            current_operation: None,
            last_activity: Utc::now(),
            last_error: None,
            metrics: ActorMetrics::default(),
        }
    }

    /// Ready for work
    pub fn is_idle(&self) -> bool {
        self.status == ActorStatus::Idle
    }

    /// Move to busy for the given operation
    pub fn begin(&mut self, operation: &str) {
        self.status = ActorStatus::Busy;
        self.current_operation = Some(operation.to_string());
        self.last_activity = Utc::now();
    }

    /// Operation finished successfully
    pub fn succeed(&mut self, latency_ms: u64) {
        self.status = ActorStatus::Idle;
        self.current_operation = None;
        self.last_activity = Utc::now();
        self.metrics.record(true, latency_ms);
    }

    /// Operation failed
    pub fn fail(&mut self, error: &str, latency_ms: u64) {
        self.status = ActorStatus::Error;
        self.current_operation = None;
        self.last_activity = Utc::now();
        self.last_error = Some(error.to_string());
        self.metrics.record(false, latency_ms);
    }

    /// Return to idle; `last_error` is kept for inspection
    pub fn reset(&mut self) {
        self.status = ActorStatus::Idle;
        self.current_operation = None;
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_role() {
        assert_eq!(ActorRole::Planning.opposite(), ActorRole::Execution);
        assert_eq!(ActorRole::Execution.opposite(), ActorRole::Planning);
    }

    #[test]
    fn test_busy_idle_cycle_updates_metrics() {
        let mut state = ActorState::new(ActorRole::Planning);
        assert!(state.is_idle());

        state.begin("generate_instructions");
        assert_eq!(state.status, ActorStatus::Busy);
        assert_eq!(state.current_operation.as_deref(), Some("generate_instructions"));

        state.succeed(100);
        state.begin("generate_instructions");
        state.succeed(300);

        assert!(state.is_idle());
        assert_eq!(state.metrics.total_operations, 2);
        assert_eq!(state.metrics.successful_operations, 2);
        assert!((state.metrics.average_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_requires_reset() {
        let mut state = ActorState::new(ActorRole::Execution);
        state.begin("execute_instructions");
        state.fail("boom", 10);

        assert_eq!(state.status, ActorStatus::Error);
        assert_eq!(state.metrics.failed_operations, 1);
        assert!(!state.is_idle());

        state.reset();
        assert!(state.is_idle());
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }
}
