use crate::domain::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Value object: Session ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Value object: Correlation ID tying together the log lines and audit
/// events of one `process_request` call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting in the backlog
    Queued,
    /// Admitted and running
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Removed before it ran, or cancelled while running
    Cancelled,
}

impl SessionStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A session as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,
    /// Workflow tracking this session, once admitted
    pub workflow_id: Option<WorkflowId>,
    /// Current status
    pub status: SessionStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// New queued session
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            workflow_id: None,
            status: SessionStatus::Queued,
            created_at: Utc::now(),
        }
    }

    /// Session bound to an existing workflow
    pub fn with_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRequest {
    /// Submitting user
    pub user: String,
    /// Free-form request text
    pub content: String,
    /// Caller supplied hints (for example `priority`)
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl UserRequest {
    /// Request without context hints
    pub fn new(user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            content: content.into(),
            context: HashMap::new(),
        }
    }

    /// Add a context hint
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// String-valued context hint
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

/// Result handed back to the user for a completed session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    /// Human readable summary
    pub summary: String,
    /// Raw output of the execution role
    pub output: Value,
    /// Artifacts produced
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Number of instruction steps executed
    pub instructions_executed: usize,
}

/// Outcome of one `process_request` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationResult {
    /// Correlation id of the call
    pub correlation_id: CorrelationId,
    /// Session processed
    pub session_id: SessionId,
    /// Workflow that tracked it
    pub workflow_id: WorkflowId,
    /// Final result
    pub result: SessionResult,
    /// Time spent in the planning phase
    pub planning_duration_ms: u64,
    /// Time spent in the execution phase
    pub execution_duration_ms: u64,
    /// Wall clock for the whole call
    pub total_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!SessionStatus::Queued.is_terminal());
        assert!(!SessionStatus::Processing.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_request_context_hint() {
        let request = UserRequest::new("ada", "summarise the report")
            .with_context("priority", json!("high"))
            .with_context("retries", json!(3));

        assert_eq!(request.context_str("priority"), Some("high"));
        assert_eq!(request.context_str("retries"), None);
        assert_eq!(request.context_str("missing"), None);
    }

    #[test]
    fn test_request_deserializes_without_context() {
        let request: UserRequest =
            serde_json::from_value(json!({"user": "ada", "content": "hi"})).unwrap();
        assert!(request.context.is_empty());
    }
}
