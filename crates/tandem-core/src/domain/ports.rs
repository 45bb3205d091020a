//! Interfaces of the external collaborators the coordinator drives.
//!
//! Content generation, protocol validation internals and audit storage all
//! live outside the core. The defaults shipped here are deliberately small:
//! a structural validator and an audit sink that writes to `tracing`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use super::protocol::{ExecutionContext, ExecutionOutcome, InstructionProtocol};
use super::session::UserRequest;
use crate::{CoreError, CoreResult};

/// The planning role: turns a request into instructions
#[async_trait]
pub trait PlanningCollaborator: Send + Sync {
    /// Produce an instruction protocol for the request
    async fn generate_instructions(&self, request: &UserRequest) -> CoreResult<InstructionProtocol>;
}

/// The execution role: carries out instructions
#[async_trait]
pub trait ExecutionCollaborator: Send + Sync {
    /// Carry out the instructions within the context's time budget
    async fn execute_instructions(
        &self,
        instructions: &InstructionProtocol,
        context: &ExecutionContext,
    ) -> CoreResult<ExecutionOutcome>;
}

/// Validates instruction protocols produced by the planning role
#[async_trait]
pub trait ProtocolValidator: Send + Sync {
    /// Raise if the protocol is malformed
    async fn validate(&self, instructions: &InstructionProtocol) -> CoreResult<()>;

    /// Raise if the protocol contains implementation code
    async fn ensure_no_code(&self, instructions: &InstructionProtocol) -> CoreResult<()>;
}

/// Result recorded on an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Phase completed
    Success,
    /// Phase failed
    Failure,
    /// Role boundary crossed
    Violation,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => f.write_str("success"),
            AuditOutcome::Failure => f.write_str("failure"),
            AuditOutcome::Violation => f.write_str("violation"),
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Actor (role) the event is about
    pub actor: String,
    /// Operation performed
    pub operation: String,
    /// Result
    pub result: AuditOutcome,
    /// Structured details
    pub metadata: Value,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// New event stamped with the current time
    pub fn new(
        actor: impl Into<String>,
        operation: impl Into<String>,
        result: AuditOutcome,
        metadata: Value,
    ) -> Self {
        Self {
            actor: actor.into(),
            operation: operation.into(),
            result,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Receives audit events after every phase and every boundary violation
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an event; failures are the sink's own concern
    async fn log_event(&self, event: AuditEvent);
}

/// Audit sink that writes events to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_event(&self, event: AuditEvent) {
        match event.result {
            AuditOutcome::Success => tracing::info!(
                target: "tandem::audit",
                actor = %event.actor,
                operation = %event.operation,
                result = %event.result,
                metadata = %event.metadata,
                "audit"
            ),
            AuditOutcome::Failure | AuditOutcome::Violation => tracing::warn!(
                target: "tandem::audit",
                actor = %event.actor,
                operation = %event.operation,
                result = %event.result,
                metadata = %event.metadata,
                "audit"
            ),
        }
    }
}

lazy_static! {
    static ref CODE_PATTERN: Regex = Regex::new(
        r"(?m)```|^\s*(fn|def|class|import|from\s+\S+\s+import|#include)\b|\bfunction\s+\w*\s*\(|=>\s*\{|[\w.]+\([^()\n]*\)\s*;\s*$|\b(let|const|var)\s+\w+\s*=[^\n]*;\s*$"
    )
    .unwrap();
}

/// Checks protocol structure without looking at its meaning
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralProtocolValidator;

#[async_trait]
impl ProtocolValidator for StructuralProtocolValidator {
    async fn validate(&self, instructions: &InstructionProtocol) -> CoreResult<()> {
        if instructions.objective.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Instruction protocol has no objective".to_string(),
            ));
        }
        if instructions.steps.is_empty() {
            return Err(CoreError::ValidationError(
                "Instruction protocol has no steps".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(instructions.steps.len());
        for step in &instructions.steps {
            if step.action.trim().is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "Instruction step {} has no action",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate instruction step id: {}",
                    step.id
                )));
            }
        }
        Ok(())
    }

    async fn ensure_no_code(&self, instructions: &InstructionProtocol) -> CoreResult<()> {
        let text = instructions.render_text();
        if let Some(found) = CODE_PATTERN.find(&text) {
            return Err(CoreError::ValidationError(format!(
                "Instruction protocol contains code: '{}'",
                found.as_str().trim()
            )));
        }
        Ok(())
    }
}

/// In-memory implementations for tests and local wiring
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use parking_lot::Mutex;

    /// Audit sink that keeps every event
    #[derive(Debug, Default)]
    pub struct MemoryAuditSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl MemoryAuditSink {
        /// Create an empty sink
        pub fn new() -> Self {
            Self::default()
        }

        /// All events recorded so far
        pub fn events(&self) -> Vec<AuditEvent> {
            self.events.lock().clone()
        }

        /// Events with the given result
        pub fn events_with(&self, result: AuditOutcome) -> Vec<AuditEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.result == result)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl AuditSink for MemoryAuditSink {
        async fn log_event(&self, event: AuditEvent) {
            self.events.lock().push(event);
        }
    }

    /// Planning role returning the same instructions for every request
    #[derive(Debug, Clone)]
    pub struct StaticPlanner {
        protocol: InstructionProtocol,
    }

    impl StaticPlanner {
        /// Planner that always answers with `protocol`
        pub fn new(protocol: InstructionProtocol) -> Self {
            Self { protocol }
        }
    }

    #[async_trait]
    impl PlanningCollaborator for StaticPlanner {
        async fn generate_instructions(&self, request: &UserRequest) -> CoreResult<InstructionProtocol> {
            let mut protocol = self.protocol.clone();
            protocol
                .metadata
                .insert("requested_by".to_string(), Value::String(request.user.clone()));
            Ok(protocol)
        }
    }

    /// Execution role that reports every step as done
    #[derive(Debug, Default, Clone, Copy)]
    pub struct EchoExecutor;

    #[async_trait]
    impl ExecutionCollaborator for EchoExecutor {
        async fn execute_instructions(
            &self,
            instructions: &InstructionProtocol,
            _context: &ExecutionContext,
        ) -> CoreResult<ExecutionOutcome> {
            let done: Vec<&str> = instructions.steps.iter().map(|s| s.action.as_str()).collect();
            let mut outcome = ExecutionOutcome::succeeded(
                format!("Completed: {}", instructions.objective),
                serde_json::json!({ "completed_steps": done }),
            );
            outcome.logs = instructions
                .steps
                .iter()
                .map(|s| format!("step {} ok", s.id))
                .collect();
            Ok(outcome)
        }
    }
}
