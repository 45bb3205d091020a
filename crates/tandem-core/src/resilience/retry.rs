//! Operation-keyed retry with exponential backoff, in front of a circuit breaker.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitKey, CircuitSnapshot, CircuitStatus};
use super::classify::{matches_retryable_pattern, ErrorCode};
use crate::domain::actor::ActorRole;
use crate::{CoreError, CoreResult};
use tandem_monitoring::CoordinationMetrics;

/// Retry policy for collaborator calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on a single delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay, 0.2 = ±20%
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Codes that are always retried
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<ErrorCode>,
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30000 }
fn default_jitter() -> f64 { 0.2 }
fn default_retryable_codes() -> Vec<ErrorCode> {
    vec![
        ErrorCode::TimeoutError,
        ErrorCode::NetworkError,
        ErrorCode::RateLimit,
        ErrorCode::ServiceUnavailable,
        ErrorCode::InternalServerError,
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            retryable_codes: default_retryable_codes(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, without jitter
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        (self.initial_delay_ms as f64 * self.multiplier.powi(exponent)).min(self.max_delay_ms as f64) as u64
    }

    /// Jittered delay before attempt `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt) as f64;
        let spread = base * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((base + offset).max(0.0) as u64)
    }

    /// Whether `error` is worth another attempt
    pub fn is_retryable(&self, error: &CoreError) -> bool {
        if error.is_fatal() {
            return false;
        }
        self.retryable_codes.contains(&error.code()) || matches_retryable_pattern(&error.to_string())
    }
}

/// Running counters kept by the executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceMetrics {
    /// Failed attempts, retried or not
    pub total_errors: u64,
    /// Failed attempts by error code
    pub errors_by_code: BTreeMap<String, u64>,
    /// Failed attempts by role
    pub errors_by_role: BTreeMap<String, u64>,
    /// Backoff-and-retry cycles started
    pub retry_attempts: u64,
    /// Calls that succeeded after at least one retry
    pub successful_retries: u64,
    /// Calls that failed after at least one retry
    pub failed_retries: u64,
    /// Times a circuit opened
    pub circuits_opened: u64,
}

/// Reports an abandoned half-open trial (future dropped mid-flight) as a
/// failure so the trial slot is never left dangling.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a CircuitKey,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(circuit = %self.key, "Call abandoned in flight");
            self.breaker.report_failure(self.key);
        }
    }
}

/// Runs collaborator calls under retry and circuit breaking
pub struct ResilientExecutor {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    metrics: Mutex<ResilienceMetrics>,
    observer: Option<CoordinationMetrics>,
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitBreaker::default())
    }
}

impl ResilientExecutor {
    /// Create an executor
    pub fn new(policy: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            policy,
            breaker,
            metrics: Mutex::new(ResilienceMetrics::default()),
            observer: None,
        }
    }

    /// Also publish retries and opened circuits to `metrics`
    pub fn with_metrics(mut self, metrics: CoordinationMetrics) -> Self {
        self.observer = Some(metrics);
        self
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The underlying circuit breaker
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Execute `call` for `(role, operation)`.
    ///
    /// The breaker is consulted once. A half-open trial gets exactly one
    /// attempt; otherwise retryable failures are retried up to
    /// `max_attempts` total attempts. Only the final failure counts against
    /// the breaker.
    pub async fn execute<T, F, Fut>(&self, role: ActorRole, operation: &str, mut call: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let key = CircuitKey::new(role, operation);
        let state = self.breaker.allow(&key).map_err(|e| {
            warn!(circuit = %key, error = %e, "Call rejected by open circuit");
            e
        })?;

        let max_attempts = match state {
            CircuitStatus::HalfOpen => 1,
            _ => self.policy.max_attempts.max(1),
        };

        let mut in_flight = InFlight {
            breaker: &self.breaker,
            key: &key,
            armed: state == CircuitStatus::HalfOpen,
        };
        let mut attempt: u32 = 1;

        loop {
            match call().await {
                Ok(value) => {
                    in_flight.disarm();
                    self.breaker.report_success(&key);
                    if attempt > 1 {
                        self.metrics.lock().successful_retries += 1;
                        debug!(circuit = %key, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    self.record_error(role, &error);

                    if attempt < max_attempts && self.policy.is_retryable(&error) {
                        let delay = self.policy.delay_for(attempt);
                        self.metrics.lock().retry_attempts += 1;
                        if let Some(observer) = &self.observer {
                            observer.record_retry(role.as_str(), operation, error.code().as_str());
                        }
                        warn!(
                            circuit = %key,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retrying after failure"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    in_flight.disarm();
                    if attempt > 1 {
                        self.metrics.lock().failed_retries += 1;
                    }
                    if self.breaker.report_failure(&key) {
                        self.metrics.lock().circuits_opened += 1;
                        if let Some(observer) = &self.observer {
                            observer.record_circuit_opened(&key.to_string());
                        }
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Snapshot of the running counters
    pub fn metrics(&self) -> ResilienceMetrics {
        self.metrics.lock().clone()
    }

    /// Snapshot of every circuit
    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.breaker.snapshot()
    }

    fn record_error(&self, role: ActorRole, error: &CoreError) {
        let mut metrics = self.metrics.lock();
        metrics.total_errors += 1;
        *metrics
            .errors_by_code
            .entry(error.code().as_str().to_string())
            .or_insert(0) += 1;
        *metrics
            .errors_by_role
            .entry(role.as_str().to_string())
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn executor(max_attempts: u32) -> ResilientExecutor {
        ResilientExecutor::new(
            RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
            CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout_ms: 10_000,
            }),
        )
    }

    #[test]
    fn test_base_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 5_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay_ms(1), 1_000);
        assert_eq!(policy.base_delay_ms(2), 2_000);
        assert_eq!(policy.base_delay_ms(3), 4_000);
        assert_eq!(policy.base_delay_ms(4), 5_000);
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let ms = policy.delay_for(2).as_millis() as u64;
            assert!((1_600..=2_400).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn test_retryability() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&CoreError::Timeout("slow".into())));
        assert!(policy.is_retryable(&CoreError::external("upstream returned 502")));
        assert!(policy.is_retryable(&CoreError::external_with_code(ErrorCode::RateLimit, "x")));
        assert!(!policy.is_retryable(&CoreError::external("the planner is sad")));
        assert!(!policy.is_retryable(&CoreError::ValidationError("timed out".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let executor = executor(3);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let result: CoreResult<()> = executor
            .execute(ActorRole::Planning, "generate_instructions", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::ValidationError("bad".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = executor.metrics();
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(metrics.errors_by_code.get("VALIDATION_ERROR"), Some(&1));
        assert_eq!(metrics.errors_by_role.get("planning"), Some(&1));
        assert_eq!(metrics.retry_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_once_against_breaker() {
        let executor = executor(3);
        let key = CircuitKey::new(ActorRole::Execution, "execute_instructions");

        let result: CoreResult<()> = executor
            .execute(ActorRole::Execution, "execute_instructions", || async {
                Err(CoreError::Network("connection reset".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(executor.breaker().failures(&key), 1);
        let metrics = executor.metrics();
        assert_eq!(metrics.total_errors, 3);
        assert_eq!(metrics.retry_attempts, 2);
        assert_eq!(metrics.failed_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_gets_one_attempt() {
        let executor = executor(3);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let _ = executor
                .execute(ActorRole::Planning, "generate_instructions", || async {
                    Err::<(), _>(CoreError::ValidationError("bad".into()))
                })
                .await;
        }
        assert_eq!(executor.metrics().circuits_opened, 1);

        tokio::time::advance(Duration::from_millis(10_000)).await;

        let c = calls.clone();
        let result: CoreResult<()> = executor
            .execute(ActorRole::Planning, "generate_instructions", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::Timeout("still slow".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            executor
                .breaker()
                .status(&CircuitKey::new(ActorRole::Planning, "generate_instructions")),
            CircuitStatus::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_backoff_does_not_count_against_breaker() {
        let executor = executor(3);
        let key = CircuitKey::new(ActorRole::Execution, "execute_instructions");

        let aborted = tokio::time::timeout(
            Duration::from_millis(100),
            executor.execute(ActorRole::Execution, "execute_instructions", || async {
                Err::<(), _>(CoreError::Network("connection reset".into()))
            }),
        )
        .await;

        assert!(aborted.is_err());
        assert_eq!(executor.metrics().retry_attempts, 1);
        assert_eq!(executor.breaker().failures(&key), 0);
        assert_eq!(executor.breaker().status(&key), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_the_circuit() {
        let executor = executor(1);
        let key = CircuitKey::new(ActorRole::Planning, "generate_instructions");
        for _ in 0..5 {
            let _ = executor
                .execute(ActorRole::Planning, "generate_instructions", || async {
                    Err::<(), _>(CoreError::Other("down".into()))
                })
                .await;
        }
        tokio::time::advance(Duration::from_millis(10_000)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            executor.execute(ActorRole::Planning, "generate_instructions", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, CoreError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        // The abandoned trial reopened the circuit instead of wedging it half-open
        assert_eq!(executor.breaker().status(&key), CircuitStatus::Open);
        tokio::time::advance(Duration::from_millis(10_000)).await;
        executor
            .execute(ActorRole::Planning, "generate_instructions", || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(executor.breaker().status(&key), CircuitStatus::Closed);
    }
}
