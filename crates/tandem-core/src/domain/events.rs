use crate::domain::session::SessionId;
use crate::domain::workflow::{StepType, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    /// Workflow created for a session
    Created {
        /// Owning session
        session_id: SessionId,
    },
    /// Step moved to in-progress
    StepStarted {
        /// Step type
        step: StepType,
    },
    /// Step completed
    StepCompleted {
        /// Step type
        step: StepType,
        /// Time spent in progress
        duration_ms: u64,
    },
    /// Step failed
    StepFailed {
        /// Step type
        step: StepType,
        /// Failure message
        error: String,
    },
    /// Every step completed or skipped
    Completed,
    /// Workflow failed
    Failed {
        /// Failure message
        error: String,
    },
    /// Workflow cancelled
    Cancelled {
        /// Cancellation reason
        reason: String,
    },
}

/// Domain event recorded on the workflow aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// The workflow this event is associated with
    pub workflow_id: WorkflowId,

    /// Event payload
    pub kind: WorkflowEventKind,

    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Create an event stamped with the current time
    pub fn new(workflow_id: WorkflowId, kind: WorkflowEventKind) -> Self {
        Self {
            workflow_id,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Returns the type of the event as a string
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            WorkflowEventKind::Created { .. } => "workflow.created",
            WorkflowEventKind::StepStarted { .. } => "workflow.step_started",
            WorkflowEventKind::StepCompleted { .. } => "workflow.step_completed",
            WorkflowEventKind::StepFailed { .. } => "workflow.step_failed",
            WorkflowEventKind::Completed => "workflow.completed",
            WorkflowEventKind::Failed { .. } => "workflow.failed",
            WorkflowEventKind::Cancelled { .. } => "workflow.cancelled",
        }
    }
}

/// Handler for domain events
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    fn handle_event(&self, event: &WorkflowEvent);
}

/// Writes every event to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventHandler;

impl DomainEventHandler for TracingEventHandler {
    fn handle_event(&self, event: &WorkflowEvent) {
        tracing::debug!(
            workflow_id = %event.workflow_id,
            event_type = event.event_type(),
            "Workflow event: {:?}",
            event.kind
        );
    }
}
