//!
//! Circuit breaker keyed by (role, operation)
//! Stops calling a collaborator operation that keeps failing until its cooldown has passed
//!

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::actor::ActorRole;
use crate::{CoreError, CoreResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Circuit is closed (normal operation)
    #[default]
    Closed,
    /// Circuit is open (failing fast)
    Open,
    /// Cooldown elapsed; one trial call decides
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "CLOSED"),
            CircuitStatus::Open => write!(f, "OPEN"),
            CircuitStatus::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Identifies one protected collaborator operation
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CircuitKey {
    /// Role owning the collaborator
    pub role: ActorRole,
    /// Operation name on the collaborator
    pub operation: String,
}

impl CircuitKey {
    /// Create a key
    pub fn new(role: ActorRole, operation: impl Into<String>) -> Self {
        Self {
            role,
            operation: operation.into(),
        }
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.operation)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before a trial call is allowed (milliseconds)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_reset_timeout_ms() -> u64 { 30_000 }

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

/// Local circuit state
#[derive(Debug)]
struct LocalCircuit {
    state: CircuitStatus,
    failures: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl LocalCircuit {
    fn closed() -> Self {
        Self {
            state: CircuitStatus::Closed,
            failures: 0,
            last_failure_time: None,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Circuit key (`role:operation`)
    pub key: String,
    /// Current status
    pub status: CircuitStatus,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Wall clock time of the last failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Configured cooldown
    pub cooldown_ms: u64,
}

/// Circuit breaker for protecting collaborator calls
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<CircuitKey, LocalCircuit>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if a call is allowed.
    ///
    /// Returns the state the call runs under, or `CircuitOpen` if the circuit
    /// is open and cooling down or a half-open trial is already in flight.
    pub fn allow(&self, key: &CircuitKey) -> CoreResult<CircuitStatus> {
        let mut circuits = self.circuits.lock();
        let now = Instant::now();
        let cooldown = Duration::from_millis(self.config.reset_timeout_ms);

        let circuit = circuits.entry(key.clone()).or_insert_with(LocalCircuit::closed);

        match circuit.state {
            CircuitStatus::Closed => Ok(CircuitStatus::Closed),
            CircuitStatus::Open => {
                let elapsed = circuit
                    .last_failure_time
                    .map(|t| now.duration_since(t))
                    .unwrap_or(cooldown);

                if elapsed >= cooldown {
                    circuit.state = CircuitStatus::HalfOpen;
                    circuit.trial_in_flight = true;
                    info!(circuit = %key, "Circuit half-open, allowing trial call");
                    Ok(CircuitStatus::HalfOpen)
                } else {
                    Err(CoreError::CircuitOpen {
                        key: key.to_string(),
                        failures: circuit.failures,
                        retry_after_ms: (cooldown - elapsed).as_millis() as u64,
                    })
                }
            }
            CircuitStatus::HalfOpen if circuit.trial_in_flight => Err(CoreError::CircuitOpen {
                key: key.to_string(),
                failures: circuit.failures,
                retry_after_ms: 0,
            }),
            CircuitStatus::HalfOpen => {
                circuit.trial_in_flight = true;
                Ok(CircuitStatus::HalfOpen)
            }
        }
    }

    /// Report a success: reset failures and close the circuit
    pub fn report_success(&self, key: &CircuitKey) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.state != CircuitStatus::Closed {
                info!(circuit = %key, "Circuit closed");
            }
            circuit.failures = 0;
            circuit.state = CircuitStatus::Closed;
            circuit.trial_in_flight = false;
        }
    }

    /// Report a failure. Returns true if this failure opened the circuit.
    pub fn report_failure(&self, key: &CircuitKey) -> bool {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(key.clone()).or_insert_with(LocalCircuit::closed);

        circuit.failures += 1;
        circuit.last_failure_time = Some(Instant::now());
        circuit.last_failure_at = Some(Utc::now());
        circuit.trial_in_flight = false;

        let opens = match circuit.state {
            CircuitStatus::HalfOpen => true,
            CircuitStatus::Closed => circuit.failures >= self.config.failure_threshold,
            CircuitStatus::Open => false,
        };
        if opens {
            circuit.state = CircuitStatus::Open;
            warn!(circuit = %key, failures = circuit.failures, "Circuit opened");
        }
        opens
    }

    /// Current status of a circuit (closed if never seen)
    pub fn status(&self, key: &CircuitKey) -> CircuitStatus {
        self.circuits
            .lock()
            .get(key)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    /// Consecutive failures recorded for a circuit
    pub fn failures(&self, key: &CircuitKey) -> u32 {
        self.circuits.lock().get(key).map(|c| c.failures).unwrap_or(0)
    }

    /// Reset a circuit to closed state
    pub fn reset_circuit(&self, key: &CircuitKey) {
        if let Some(circuit) = self.circuits.lock().get_mut(key) {
            *circuit = LocalCircuit::closed();
        }
    }

    /// Snapshot of every known circuit, sorted by key
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .circuits
            .lock()
            .iter()
            .map(|(key, circuit)| CircuitSnapshot {
                key: key.to_string(),
                status: circuit.state,
                consecutive_failures: circuit.failures,
                last_failure_time: circuit.last_failure_at,
                cooldown_ms: self.config.reset_timeout_ms,
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CircuitKey {
        CircuitKey::new(ActorRole::Planning, "generate_instructions")
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 1_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let breaker = breaker();
        for i in 1..5 {
            assert!(!breaker.report_failure(&key()), "failure {i} must not open");
            assert_eq!(breaker.allow(&key()).unwrap(), CircuitStatus::Closed);
        }
        assert!(breaker.report_failure(&key()));
        assert_eq!(breaker.status(&key()), CircuitStatus::Open);

        let err = breaker.allow(&key()).unwrap_err();
        assert!(matches!(err, CoreError::CircuitOpen { failures: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.report_failure(&key());
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breaker.allow(&key()).unwrap(), CircuitStatus::HalfOpen);
        // Second caller during the trial is rejected
        assert!(breaker.allow(&key()).is_err());

        breaker.report_success(&key());
        assert_eq!(breaker.status(&key()), CircuitStatus::Closed);
        assert_eq!(breaker.failures(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.report_failure(&key());
        }
        tokio::time::advance(Duration::from_millis(1_500)).await;
        breaker.allow(&key()).unwrap();

        assert!(breaker.report_failure(&key()));
        assert_eq!(breaker.status(&key()), CircuitStatus::Open);
        match breaker.allow(&key()).unwrap_err() {
            CoreError::CircuitOpen { retry_after_ms, .. } => assert_eq!(retry_after_ms, 1_000),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let breaker = breaker();
        let other = CircuitKey::new(ActorRole::Execution, "execute_instructions");
        for _ in 0..5 {
            breaker.report_failure(&key());
        }
        assert_eq!(breaker.allow(&other).unwrap(), CircuitStatus::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, "execution:execute_instructions");
        assert_eq!(snapshot[1].status, CircuitStatus::Open);

        breaker.reset_circuit(&key());
        assert_eq!(breaker.status(&key()), CircuitStatus::Closed);
    }
}
