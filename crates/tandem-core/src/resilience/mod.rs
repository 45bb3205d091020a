//! Resilience module for the coordination engine
//! Two separate mechanisms wrap every collaborator call: the retry executor
//! (operation-keyed retry plus circuit breaking) and the recovery manager
//! (error-code-keyed strategies). The coordinator composes them.

pub mod circuit_breaker;
pub mod classify;
pub mod recovery;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitKey, CircuitSnapshot, CircuitStatus};
pub use classify::{classify_message, matches_retryable_pattern, ErrorCode};
pub use recovery::{
    RecoveryAction, RecoveryConfig, RecoveryKind, RecoveryManager, RecoveryMetrics, RecoveryOutcome,
    RecoveryStrategy, StrategyConfig,
};
pub use retry::{ResilienceMetrics, ResilientExecutor, RetryPolicy};
