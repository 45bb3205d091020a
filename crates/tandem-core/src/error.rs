use thiserror::Error;

use crate::resilience::classify::{classify_message, ErrorCode};

/// Core error type for the Tandem coordination engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Workflow not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Illegal workflow or step transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A step was completed without being started
    #[error("Step {step} is not in progress (status: {status})")]
    StepNotInProgress {
        /// Step type
        step: String,
        /// Actual step status
        status: String,
    },

    /// A role attempted an operation category it is not allowed to perform
    #[error("Boundary violation: {role} role attempted '{operation}' ({category})")]
    BoundaryViolation {
        /// Offending role
        role: String,
        /// Operation type requested
        operation: String,
        /// Category the operation maps to
        category: String,
    },

    /// A role emitted content belonging to the other role
    #[error("Content boundary violation in {role} output: {}", .violations.join("; "))]
    ContentBoundaryViolation {
        /// Role whose output was inspected
        role: String,
        /// Every offending fragment found
        violations: Vec<String>,
    },

    /// Malformed protocol or code leaked into instructions
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Network failure talking to a collaborator
    #[error("Network error: {0}")]
    Network(String),

    /// Collaborator rate limited the request
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Collaborator temporarily unavailable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Collaborator reported an internal failure
    #[error("Internal server error: {0}")]
    InternalServer(String),

    /// Error raised by an external collaborator, optionally carrying an explicit code
    #[error("{message}")]
    External {
        /// Explicit code supplied by the collaborator
        code: Option<ErrorCode>,
        /// Original message
        message: String,
    },

    /// Circuit breaker rejected the call without invoking it
    #[error("Circuit breaker open for {key} after {failures} failures. Retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Circuit key (role:operation)
        key: String,
        /// Consecutive failures recorded
        failures: u32,
        /// Remaining cooldown in milliseconds
        retry_after_ms: u64,
    },

    /// A role is busy, errored or not bound
    #[error("Actor unavailable: {0}")]
    ActorUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Error raised by a collaborator without an explicit code
    pub fn external(message: impl Into<String>) -> Self {
        CoreError::External {
            code: None,
            message: message.into(),
        }
    }

    /// Error raised by a collaborator with an explicit code
    pub fn external_with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        CoreError::External {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Stable classification code.
    ///
    /// An explicit code carried on the error wins; otherwise the message is
    /// matched against the known failure patterns.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::BoundaryViolation { .. } | CoreError::ContentBoundaryViolation { .. } => {
                ErrorCode::BoundaryViolation
            }
            CoreError::ValidationError(_) => ErrorCode::ValidationError,
            CoreError::Timeout(_) => ErrorCode::TimeoutError,
            CoreError::Network(_) => ErrorCode::NetworkError,
            CoreError::RateLimited(_) => ErrorCode::RateLimit,
            CoreError::ServiceUnavailable(_) | CoreError::CircuitOpen { .. } => {
                ErrorCode::ServiceUnavailable
            }
            CoreError::InternalServer(_) => ErrorCode::InternalServerError,
            CoreError::External {
                code: Some(code), ..
            } => *code,
            CoreError::External { code: None, message } => classify_message(message),
            CoreError::Other(message) => classify_message(message),
            _ => ErrorCode::UnknownError,
        }
    }

    /// Boundary and validation failures are fatal and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::BoundaryViolation | ErrorCode::ValidationError
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::ConfigurationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
