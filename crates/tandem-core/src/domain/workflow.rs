use crate::{
    domain::events::{WorkflowEvent, WorkflowEventKind},
    domain::session::SessionId,
    CoreError, CoreResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Value object: Workflow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

/// The five phase-steps every workflow passes through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Request accepted
    Request,
    /// Planning role produces instructions
    Planning,
    /// Instructions validated
    Validation,
    /// Execution role carries out instructions
    Execution,
    /// Result assembled
    Result,
}

/// Legal transitions: (from, to, guarded). A guarded edge additionally
/// requires the predecessor step to be `completed`.
const TRANSITIONS: [(StepType, StepType, bool); 4] = [
    (StepType::Request, StepType::Planning, false),
    (StepType::Planning, StepType::Validation, false),
    (StepType::Validation, StepType::Execution, true),
    (StepType::Execution, StepType::Result, false),
];

impl StepType {
    /// All step types in workflow order
    pub const ORDERED: [StepType; 5] = [
        StepType::Request,
        StepType::Planning,
        StepType::Validation,
        StepType::Execution,
        StepType::Result,
    ];

    /// Position of the step in the workflow
    pub fn index(self) -> usize {
        match self {
            StepType::Request => 0,
            StepType::Planning => 1,
            StepType::Validation => 2,
            StepType::Execution => 3,
            StepType::Result => 4,
        }
    }

    /// Designated predecessor and whether the edge is guarded
    pub fn predecessor(self) -> Option<(StepType, bool)> {
        TRANSITIONS
            .iter()
            .find(|(_, to, _)| *to == self)
            .map(|(from, _, guarded)| (*from, *guarded))
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Request => "request",
            StepType::Planning => "planning",
            StepType::Validation => "validation",
            StepType::Execution => "execution",
            StepType::Result => "result",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet
    Pending,
    /// Currently running
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Will never run (workflow cancelled)
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Steps are still being worked on
    Active,
    /// Every step completed or skipped
    Completed,
    /// A step failed
    Failed,
    /// Cancelled before finishing
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Active)
    }
}

/// One phase-step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier
    pub id: StepId,
    /// Step type
    pub step_type: StepType,
    /// Current status
    pub status: StepStatus,
    /// When the step moved to in-progress
    pub start_time: Option<DateTime<Utc>>,
    /// When the step completed or failed
    pub end_time: Option<DateTime<Utc>>,
    /// end - start, in milliseconds
    pub duration_ms: Option<u64>,
    /// Input recorded at start
    pub input: Option<Value>,
    /// Output recorded at completion
    pub output: Option<Value>,
    /// Error recorded at failure
    pub error: Option<String>,
}

impl Step {
    fn pending(step_type: StepType) -> Self {
        Self {
            id: StepId(Uuid::new_v4().to_string()),
            step_type,
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            input: None,
            output: None,
            error: None,
        }
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = self
            .start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }
}

/// Progress summary of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    /// Completed steps
    pub completed: usize,
    /// Total steps
    pub total: usize,
    /// completed / total, 0-100
    pub percentage: f64,
    /// Step currently in progress, if any
    pub current_step_type: Option<StepType>,
}

/// Aggregate: Workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier
    pub id: WorkflowId,

    /// Owning session
    pub session_id: SessionId,

    /// Current status
    pub status: WorkflowStatus,

    /// Steps in fixed type order
    pub steps: Vec<Step>,

    /// Most recently completed step
    pub last_completed: Option<StepType>,

    /// Error message if the workflow failed
    pub error: Option<String>,

    /// Reason given when cancelled
    pub cancel_reason: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Domain events not yet drained
    #[serde(skip)]
    events: Vec<WorkflowEvent>,
}

impl Workflow {
    /// Create a new workflow with all five steps pending
    pub fn new(session_id: SessionId) -> Self {
        let id = WorkflowId::generate();
        let now = Utc::now();

        let mut workflow = Self {
            id: id.clone(),
            session_id: session_id.clone(),
            status: WorkflowStatus::Active,
            steps: StepType::ORDERED.iter().map(|t| Step::pending(*t)).collect(),
            last_completed: None,
            error: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(12),
        };

        workflow.record_event(WorkflowEventKind::Created { session_id });
        workflow
    }

    /// Get a step by type
    #[inline]
    pub fn step(&self, step_type: StepType) -> &Step {
        &self.steps[step_type.index()]
    }

    /// The step currently in progress
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::InProgress)
    }

    /// Start a step if the transition is legal
    pub fn start_step(&mut self, step_type: StepType, input: Value) -> CoreResult<()> {
        self.ensure_active(step_type)?;

        if let Some(current) = self.current_step() {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot start {} while {} is in progress",
                step_type, current.step_type
            )));
        }

        let status = self.step(step_type).status;
        if status != StepStatus::Pending {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot start {} from status {}",
                step_type, status
            )));
        }

        if let Some((predecessor, guarded)) = step_type.predecessor() {
            if self.last_completed != Some(predecessor) {
                return Err(CoreError::InvalidTransition(format!(
                    "Cannot start {} after {}; expected {} to complete first",
                    step_type,
                    self.last_completed.map_or("nothing", StepType::as_str),
                    predecessor
                )));
            }
            if guarded && self.step(predecessor).status != StepStatus::Completed {
                return Err(CoreError::InvalidTransition(format!(
                    "Cannot start {}: {} is {}",
                    step_type,
                    predecessor,
                    self.step(predecessor).status
                )));
            }
            // Strict walk: every earlier step must have completed.
            if let Some(open) = self.steps[..step_type.index()]
                .iter()
                .find(|s| s.status != StepStatus::Completed)
            {
                return Err(CoreError::InvalidTransition(format!(
                    "Cannot start {}: earlier step {} is {}",
                    step_type, open.step_type, open.status
                )));
            }
        }

        let step = &mut self.steps[step_type.index()];
        step.status = StepStatus::InProgress;
        step.start_time = Some(Utc::now());
        step.input = Some(input);

        self.record_event(WorkflowEventKind::StepStarted { step: step_type });
        self.update_timestamp();
        Ok(())
    }

    /// Complete an in-progress step; completes the workflow when nothing is left
    pub fn complete_step(&mut self, step_type: StepType, output: Value) -> CoreResult<()> {
        let step = &mut self.steps[step_type.index()];
        if step.status != StepStatus::InProgress {
            return Err(CoreError::StepNotInProgress {
                step: step_type.to_string(),
                status: step.status.to_string(),
            });
        }

        step.finish(StepStatus::Completed);
        step.output = Some(output);
        let duration_ms = step.duration_ms.unwrap_or(0);
        self.last_completed = Some(step_type);

        self.record_event(WorkflowEventKind::StepCompleted {
            step: step_type,
            duration_ms,
        });

        if self
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
        {
            self.status = WorkflowStatus::Completed;
            self.record_event(WorkflowEventKind::Completed);
        }

        self.update_timestamp();
        Ok(())
    }

    /// Fail a step and with it the whole workflow
    pub fn fail_step(&mut self, step_type: StepType, error: String) -> CoreResult<()> {
        self.ensure_active(step_type)?;

        let step = &mut self.steps[step_type.index()];
        if !matches!(step.status, StepStatus::Pending | StepStatus::InProgress) {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot fail {} from status {}",
                step_type, step.status
            )));
        }

        step.finish(StepStatus::Failed);
        step.error = Some(error.clone());
        self.status = WorkflowStatus::Failed;
        self.error = Some(error.clone());

        self.record_event(WorkflowEventKind::StepFailed {
            step: step_type,
            error: error.clone(),
        });
        self.record_event(WorkflowEventKind::Failed { error });

        self.update_timestamp();
        Ok(())
    }

    /// Cancel the workflow; unfinished steps are skipped
    pub fn cancel(&mut self, reason: String) -> CoreResult<()> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot cancel workflow in state: {:?}",
                self.status
            )));
        }

        for step in &mut self.steps {
            if matches!(step.status, StepStatus::Pending | StepStatus::InProgress) {
                step.status = StepStatus::Skipped;
            }
        }
        self.status = WorkflowStatus::Cancelled;
        self.cancel_reason = Some(reason.clone());

        self.record_event(WorkflowEventKind::Cancelled { reason });
        self.update_timestamp();
        Ok(())
    }

    /// Progress summary
    pub fn progress(&self) -> WorkflowProgress {
        let total = self.steps.len();
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();

        WorkflowProgress {
            completed,
            total,
            percentage: ((completed as f64 / total as f64) * 100.0).round(),
            current_step_type: self.current_step().map(|s| s.step_type),
        }
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.events)
    }

    fn ensure_active(&self, step_type: StepType) -> CoreResult<()> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot change {} while workflow is {:?}",
                step_type, self.status
            )));
        }
        Ok(())
    }

    fn record_event(&mut self, kind: WorkflowEventKind) {
        self.events.push(WorkflowEvent::new(self.id.clone(), kind));
    }

    #[inline]
    fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }
}
