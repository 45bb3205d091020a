use crate::domain::session::{CorrelationId, SessionId, SessionResult};
use crate::domain::workflow::WorkflowId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// One step of an instruction protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionStep {
    /// Step identifier, unique within the protocol
    pub id: String,
    /// What to do, as a verb phrase
    pub action: String,
    /// Longer description
    #[serde(default)]
    pub description: String,
    /// Structured parameters
    #[serde(default)]
    pub parameters: Value,
}

impl InstructionStep {
    /// Step without parameters
    pub fn new(id: impl Into<String>, action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            description: description.into(),
            parameters: Value::Null,
        }
    }
}

/// Structured, implementation-free output of the planning role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionProtocol {
    /// Protocol identifier
    pub id: String,
    /// What the instructions should achieve
    pub objective: String,
    /// Ordered steps
    pub steps: Vec<InstructionStep>,
    /// Constraints the execution role must respect
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InstructionProtocol {
    /// Empty protocol for an objective
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            objective: objective.into(),
            steps: Vec::new(),
            constraints: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Append a step
    pub fn with_step(mut self, step: InstructionStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a constraint
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Flatten the human readable parts into one text block for content scanning.
    pub fn render_text(&self) -> String {
        let mut text = String::with_capacity(256);
        text.push_str(&self.objective);
        for step in &self.steps {
            text.push('\n');
            text.push_str(&step.action);
            if !step.description.is_empty() {
                text.push_str(": ");
                text.push_str(&step.description);
            }
            if !step.parameters.is_null() {
                text.push(' ');
                text.push_str(&step.parameters.to_string());
            }
        }
        for constraint in &self.constraints {
            text.push('\n');
            text.push_str(constraint);
        }
        text
    }
}

/// Context passed to the execution role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Session being processed
    pub session_id: SessionId,
    /// Workflow tracking it
    pub workflow_id: WorkflowId,
    /// Correlation id of the coordination call
    pub correlation_id: CorrelationId,
    /// Wall-clock budget for the call; the coordinator enforces it as well
    pub timeout_ms: u64,
}

/// Raw result reported by the execution role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether the instructions were carried out
    pub success: bool,
    /// Structured output
    #[serde(default)]
    pub output: Value,
    /// Short summary
    #[serde(default)]
    pub summary: Option<String>,
    /// Produced artifacts
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Log lines
    #[serde(default)]
    pub logs: Vec<String>,
    /// Failure message when `success` is false
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// Successful outcome
    pub fn succeeded(summary: impl Into<String>, output: Value) -> Self {
        Self {
            success: true,
            output,
            summary: Some(summary.into()),
            artifacts: Vec::new(),
            logs: Vec::new(),
            error: None,
        }
    }

    /// Failed outcome
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            summary: None,
            artifacts: Vec::new(),
            logs: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Text scanned for planning-style language
    pub fn render_text(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.logs.len() + 2);
        if let Some(summary) = &self.summary {
            parts.push(summary.clone());
        }
        match &self.output {
            Value::Null => {}
            Value::String(s) => parts.push(s.clone()),
            other => parts.push(other.to_string()),
        }
        parts.extend(self.logs.iter().cloned());
        parts.join("\n")
    }

    /// Convert into the session's result shape
    pub fn into_session_result(self, instructions_executed: usize) -> SessionResult {
        let summary = self
            .summary
            .unwrap_or_else(|| format!("Executed {} instruction(s)", instructions_executed));
        SessionResult {
            summary,
            output: self.output,
            artifacts: self.artifacts,
            instructions_executed,
        }
    }
}
