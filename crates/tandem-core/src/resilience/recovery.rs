//! Error-code-keyed recovery strategies.
//!
//! Where the retry executor decides how hard to re-attempt one flaky call,
//! the recovery manager decides what to do about a whole class of failure:
//! re-run the operation with linear backoff, run a rollback or compensating
//! action, or leave it for a human.

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::classify::ErrorCode;
use crate::{CoreError, CoreResult};

/// How a class of failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Re-run the failed operation with linear backoff
    Retry,
    /// Undo partial effects once
    Rollback,
    /// Run a compensating action once
    Compensate,
    /// Log and leave for a human
    Manual,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryKind::Retry => "retry",
            RecoveryKind::Rollback => "rollback",
            RecoveryKind::Compensate => "compensate",
            RecoveryKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Action run by a rollback or compensate strategy
pub type RecoveryAction = Arc<dyn Fn(&CoreError) -> BoxFuture<'static, CoreResult<()>> + Send + Sync>;

/// Strategy registered for one error code
#[derive(Clone)]
pub struct RecoveryStrategy {
    /// Strategy type
    pub kind: RecoveryKind,
    /// Retries attempted by a `retry` strategy
    pub max_attempts: u32,
    /// Linear backoff unit; the n-th retry waits `backoff_ms * n`
    pub backoff_ms: u64,
    /// Action for `rollback`/`compensate`
    pub action: Option<RecoveryAction>,
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("kind", &self.kind)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_ms", &self.backoff_ms)
            .field("action", &self.action.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RecoveryStrategy {
    /// Retry strategy
    pub fn retry(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            kind: RecoveryKind::Retry,
            max_attempts,
            backoff_ms,
            action: None,
        }
    }

    /// Rollback strategy running `action` once
    pub fn rollback(action: RecoveryAction) -> Self {
        Self {
            kind: RecoveryKind::Rollback,
            max_attempts: 1,
            backoff_ms: 0,
            action: Some(action),
        }
    }

    /// Compensate strategy; without an action it only records the failure
    pub fn compensate(action: Option<RecoveryAction>) -> Self {
        Self {
            kind: RecoveryKind::Compensate,
            max_attempts: 1,
            backoff_ms: 0,
            action,
        }
    }

    /// Manual strategy
    pub fn manual() -> Self {
        Self {
            kind: RecoveryKind::Manual,
            max_attempts: 0,
            backoff_ms: 0,
            action: None,
        }
    }
}

/// Serializable form of a strategy, as found in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Strategy type
    pub kind: RecoveryKind,
    /// Retries for `retry`
    #[serde(default)]
    pub max_attempts: u32,
    /// Backoff unit for `retry`
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Whether the coordinator consults the recovery manager at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Strategy per error code name (case-insensitive, e.g. `TIMEOUT_ERROR`)
    #[serde(default = "default_strategies")]
    pub strategies: BTreeMap<String, StrategyConfig>,
}

fn default_enabled() -> bool { true }

fn default_strategies() -> BTreeMap<String, StrategyConfig> {
    let retry = |max_attempts, backoff_ms| StrategyConfig {
        kind: RecoveryKind::Retry,
        max_attempts,
        backoff_ms,
    };
    let only = |kind| StrategyConfig {
        kind,
        max_attempts: 0,
        backoff_ms: 0,
    };

    BTreeMap::from([
        (ErrorCode::TimeoutError.as_str().to_string(), retry(2, 1000)),
        (ErrorCode::NetworkError.as_str().to_string(), retry(2, 2000)),
        (ErrorCode::RateLimit.as_str().to_string(), retry(2, 5000)),
        (ErrorCode::ServiceUnavailable.as_str().to_string(), retry(2, 3000)),
        (ErrorCode::InternalServerError.as_str().to_string(), only(RecoveryKind::Compensate)),
        (ErrorCode::ValidationError.as_str().to_string(), only(RecoveryKind::Manual)),
        (ErrorCode::BoundaryViolation.as_str().to_string(), only(RecoveryKind::Manual)),
    ])
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            strategies: default_strategies(),
        }
    }
}

/// Result of a recovery attempt
#[derive(Debug)]
pub enum RecoveryOutcome<T> {
    /// A retry succeeded
    Recovered {
        /// Value produced by the successful retry
        value: T,
        /// Retries it took
        attempts: u32,
    },
    /// The error stands; any rollback/compensate action has run
    Unresolved {
        /// Error to surface (the last collaborator error for `retry`, the original otherwise)
        error: CoreError,
        /// Strategy that handled it, if any
        strategy: Option<RecoveryKind>,
    },
}

impl<T> RecoveryOutcome<T> {
    /// Collapse into a result
    pub fn into_result(self) -> CoreResult<T> {
        match self {
            RecoveryOutcome::Recovered { value, .. } => Ok(value),
            RecoveryOutcome::Unresolved { error, .. } => Err(error),
        }
    }
}

/// Counters kept by the recovery manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    /// Errors handed to the manager
    pub handled: u64,
    /// Errors resolved by a retry strategy
    pub recovered: u64,
    /// Rollback/compensate actions run
    pub actions_run: u64,
    /// Errors left for manual intervention
    pub manual: u64,
    /// Errors with no registered strategy
    pub unhandled: u64,
}

/// Looks up and applies the strategy registered for an error's code
pub struct RecoveryManager {
    strategies: RwLock<HashMap<ErrorCode, RecoveryStrategy>>,
    metrics: Mutex<RecoveryMetrics>,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryManager {
    /// Manager without strategies
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            metrics: Mutex::new(RecoveryMetrics::default()),
        }
    }

    /// Manager with the strategies named in `config`
    pub fn from_config(config: &RecoveryConfig) -> CoreResult<Self> {
        let manager = Self::new();
        for (name, strategy) in &config.strategies {
            let code: ErrorCode = name.parse()?;
            let strategy = match strategy.kind {
                RecoveryKind::Retry => RecoveryStrategy::retry(strategy.max_attempts, strategy.backoff_ms),
                RecoveryKind::Compensate => RecoveryStrategy::compensate(None),
                RecoveryKind::Manual => RecoveryStrategy::manual(),
                RecoveryKind::Rollback => {
                    return Err(CoreError::ConfigurationError(format!(
                        "Rollback strategy for {} needs an action; register it in code",
                        code
                    )))
                }
            };
            manager.register(code, strategy);
        }
        Ok(manager)
    }

    /// Register (or replace) the strategy for `code`
    pub fn register(&self, code: ErrorCode, strategy: RecoveryStrategy) {
        self.strategies.write().insert(code, strategy);
    }

    /// Strategy registered for `code`
    pub fn strategy(&self, code: ErrorCode) -> Option<RecoveryStrategy> {
        self.strategies.read().get(&code).cloned()
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> RecoveryMetrics {
        self.metrics.lock().clone()
    }

    /// Apply the strategy registered for `error`'s code.
    ///
    /// `retry` is only called by a `retry` strategy.
    pub async fn recover<T, F, Fut>(&self, error: CoreError, mut retry: F) -> RecoveryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let code = error.code();
        self.metrics.lock().handled += 1;

        let Some(strategy) = self.strategy(code) else {
            self.metrics.lock().unhandled += 1;
            info!(code = %code, error = %error, "No recovery strategy registered");
            return RecoveryOutcome::Unresolved {
                error,
                strategy: None,
            };
        };

        match strategy.kind {
            RecoveryKind::Retry => {
                let mut last_error = error;
                for attempt in 1..=strategy.max_attempts {
                    let wait = Duration::from_millis(strategy.backoff_ms.saturating_mul(attempt as u64));
                    info!(code = %code, attempt, wait_ms = wait.as_millis() as u64, "Recovery retry");
                    tokio::time::sleep(wait).await;

                    match retry().await {
                        Ok(value) => {
                            self.metrics.lock().recovered += 1;
                            info!(code = %code, attempt, "Recovered by retry");
                            return RecoveryOutcome::Recovered {
                                value,
                                attempts: attempt,
                            };
                        }
                        Err(e @ CoreError::CircuitOpen { .. }) => {
                            warn!(code = %code, attempt, error = %e, "Recovery retry rejected by open circuit");
                            break;
                        }
                        Err(e) => {
                            warn!(code = %code, attempt, error = %e, "Recovery retry failed");
                            last_error = e;
                        }
                    }
                }
                RecoveryOutcome::Unresolved {
                    error: last_error,
                    strategy: Some(RecoveryKind::Retry),
                }
            }
            RecoveryKind::Rollback | RecoveryKind::Compensate => {
                if let Some(action) = &strategy.action {
                    self.metrics.lock().actions_run += 1;
                    if let Err(action_error) = action(&error).await {
                        error!(
                            code = %code,
                            strategy = %strategy.kind,
                            error = %action_error,
                            "Recovery action failed"
                        );
                    }
                } else {
                    warn!(code = %code, strategy = %strategy.kind, "Recovery strategy has no action");
                }
                RecoveryOutcome::Unresolved {
                    error,
                    strategy: Some(strategy.kind),
                }
            }
            RecoveryKind::Manual => {
                self.metrics.lock().manual += 1;
                error!(code = %code, error = %error, "Manual intervention required");
                RecoveryOutcome::Unresolved {
                    error,
                    strategy: Some(RecoveryKind::Manual),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_uses_linear_backoff() {
        let manager = RecoveryManager::new();
        manager.register(ErrorCode::TimeoutError, RecoveryStrategy::retry(3, 100));

        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let c = calls.clone();
        let outcome = manager
            .recover(CoreError::Timeout("slow".into()), || {
                let c = c.clone();
                async move {
                    match c.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Err(CoreError::Timeout("still slow".into())),
                        _ => Ok("done"),
                    }
                }
            })
            .await;

        match outcome {
            RecoveryOutcome::Recovered { value, attempts } => {
                assert_eq!(value, "done");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // 100 + 200 + 300
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(600) && elapsed < Duration::from_millis(650));
        assert_eq!(manager.metrics().recovered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retry_surfaces_last_error() {
        let manager = RecoveryManager::new();
        manager.register(ErrorCode::NetworkError, RecoveryStrategy::retry(2, 10));

        let outcome: RecoveryOutcome<()> = manager
            .recover(CoreError::Network("reset".into()), || async {
                Err(CoreError::Network("refused".into()))
            })
            .await;

        let err = outcome.into_result().unwrap_err();
        assert_eq!(err, CoreError::Network("refused".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retry_and_keeps_collaborator_error() {
        let manager = RecoveryManager::new();
        manager.register(ErrorCode::NetworkError, RecoveryStrategy::retry(3, 10));

        let calls = AtomicU32::new(0);
        let outcome: RecoveryOutcome<()> = manager
            .recover(CoreError::Network("reset".into()), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CoreError::CircuitOpen {
                        key: "planning:generate_instructions".into(),
                        failures: 5,
                        retry_after_ms: 30_000,
                    })
                }
            })
            .await;

        assert_eq!(outcome.into_result().unwrap_err(), CoreError::Network("reset".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compensate_runs_action_once_and_keeps_error() {
        let manager = RecoveryManager::new();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let action: RecoveryAction = Arc::new(move |_err: &CoreError| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        manager.register(
            ErrorCode::InternalServerError,
            RecoveryStrategy::compensate(Some(action)),
        );

        let retries = AtomicU32::new(0);
        let outcome: RecoveryOutcome<()> = manager
            .recover(CoreError::InternalServer("500".into()), || {
                retries.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(
            outcome,
            RecoveryOutcome::Unresolved {
                strategy: Some(RecoveryKind::Compensate),
                ..
            }
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_and_unregistered_leave_error_unchanged() {
        let manager = RecoveryManager::from_config(&RecoveryConfig::default()).unwrap();

        let original = CoreError::ValidationError("code leaked".into());
        let outcome: RecoveryOutcome<()> = manager
            .recover(original.clone(), || async { Ok(()) })
            .await;
        assert_eq!(outcome.into_result().unwrap_err(), original);

        let unknown = CoreError::external("the planner is sad");
        let outcome: RecoveryOutcome<()> = manager
            .recover(unknown.clone(), || async { Ok(()) })
            .await;
        assert!(matches!(
            outcome,
            RecoveryOutcome::Unresolved { strategy: None, .. }
        ));

        let metrics = manager.metrics();
        assert_eq!(metrics.manual, 1);
        assert_eq!(metrics.unhandled, 1);
    }

    #[test]
    fn test_default_config_registers_expected_strategies() {
        let manager = RecoveryManager::from_config(&RecoveryConfig::default()).unwrap();
        let timeout = manager.strategy(ErrorCode::TimeoutError).unwrap();
        assert_eq!(timeout.kind, RecoveryKind::Retry);
        assert_eq!(timeout.max_attempts, 2);
        assert_eq!(timeout.backoff_ms, 1000);
        assert_eq!(
            manager.strategy(ErrorCode::BoundaryViolation).unwrap().kind,
            RecoveryKind::Manual
        );
        assert!(manager.strategy(ErrorCode::UnknownError).is_none());
    }
}
