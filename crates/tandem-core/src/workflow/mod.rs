//! Workflow state machine service.
//!
//! Owns every workflow aggregate created by the engine and drains their
//! domain events to a [`DomainEventHandler`] after each mutation.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::events::{DomainEventHandler, TracingEventHandler};
use crate::domain::session::SessionId;
use crate::domain::workflow::{StepType, Workflow, WorkflowId, WorkflowProgress};
use crate::{CoreError, CoreResult};

/// Tracks ordered step progression for each session
pub struct WorkflowStateMachine {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
    event_handler: Arc<dyn DomainEventHandler>,
}

impl Default for WorkflowStateMachine {
    fn default() -> Self {
        Self::new(Arc::new(TracingEventHandler))
    }
}

impl WorkflowStateMachine {
    /// Create a state machine publishing events to `event_handler`
    pub fn new(event_handler: Arc<dyn DomainEventHandler>) -> Self {
        Self {
            workflows: Mutex::new(HashMap::with_capacity(16)),
            event_handler,
        }
    }

    /// Create a workflow with all five steps pending
    pub fn create_workflow(&self, session_id: &SessionId) -> WorkflowId {
        let mut workflow = Workflow::new(session_id.clone());
        let id = workflow.id.clone();
        let events = workflow.take_events();

        self.workflows.lock().insert(id.clone(), workflow);
        self.publish(&events);

        info!(workflow_id = %id, session_id = %session_id, "Workflow created");
        id
    }

    /// Start a step
    pub fn start_step(&self, workflow_id: &WorkflowId, step: StepType, input: Value) -> CoreResult<()> {
        self.mutate(workflow_id, |wf| wf.start_step(step, input))
            .map_err(|e| {
                warn!(workflow_id = %workflow_id, step = %step, error = %e, "Rejected step start");
                e
            })?;
        debug!(workflow_id = %workflow_id, step = %step, "Step started");
        Ok(())
    }

    /// Complete an in-progress step
    pub fn complete_step(&self, workflow_id: &WorkflowId, step: StepType, output: Value) -> CoreResult<()> {
        self.mutate(workflow_id, |wf| wf.complete_step(step, output))?;
        debug!(workflow_id = %workflow_id, step = %step, "Step completed");
        Ok(())
    }

    /// Fail a step and the workflow with it
    pub fn fail_step(&self, workflow_id: &WorkflowId, step: StepType, error: impl Into<String>) -> CoreResult<()> {
        let error = error.into();
        self.mutate(workflow_id, |wf| wf.fail_step(step, error.clone()))?;
        warn!(workflow_id = %workflow_id, step = %step, error = %error, "Step failed");
        Ok(())
    }

    /// Cancel a non-terminal workflow
    pub fn cancel_workflow(&self, workflow_id: &WorkflowId, reason: impl Into<String>) -> CoreResult<()> {
        let reason = reason.into();
        self.mutate(workflow_id, |wf| wf.cancel(reason.clone()))?;
        info!(workflow_id = %workflow_id, reason = %reason, "Workflow cancelled");
        Ok(())
    }

    /// Progress summary
    pub fn get_progress(&self, workflow_id: &WorkflowId) -> CoreResult<WorkflowProgress> {
        self.workflows
            .lock()
            .get(workflow_id)
            .map(Workflow::progress)
            .ok_or_else(|| CoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Snapshot of a workflow
    pub fn get_workflow(&self, workflow_id: &WorkflowId) -> CoreResult<Workflow> {
        self.workflows
            .lock()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| CoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// The step currently in progress, if any
    pub fn current_step(&self, workflow_id: &WorkflowId) -> CoreResult<Option<StepType>> {
        self.get_progress(workflow_id).map(|p| p.current_step_type)
    }

    fn mutate<F>(&self, workflow_id: &WorkflowId, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Workflow) -> CoreResult<()>,
    {
        let events = {
            let mut workflows = self.workflows.lock();
            let workflow = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| CoreError::WorkflowNotFound(workflow_id.to_string()))?;
            f(workflow)?;
            workflow.take_events()
        };
        self.publish(&events);
        Ok(())
    }

    fn publish(&self, events: &[crate::domain::events::WorkflowEvent]) {
        for event in events {
            self.event_handler.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::WorkflowEvent;
    use crate::domain::workflow::{StepStatus, WorkflowStatus};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    impl DomainEventHandler for RecordingHandler {
        fn handle_event(&self, event: &WorkflowEvent) {
            self.events.lock().push(event.event_type().to_string());
        }
    }

    fn machine() -> (WorkflowStateMachine, WorkflowId) {
        let machine = WorkflowStateMachine::default();
        let id = machine.create_workflow(&SessionId::from("s-1"));
        (machine, id)
    }

    fn advance(machine: &WorkflowStateMachine, id: &WorkflowId, steps: &[StepType]) {
        for step in steps {
            machine.start_step(id, *step, json!({})).unwrap();
            machine.complete_step(id, *step, json!({})).unwrap();
        }
    }

    #[test]
    fn test_execution_before_validation_is_rejected() {
        let (machine, id) = machine();
        advance(&machine, &id, &[StepType::Request, StepType::Planning]);

        let err = machine
            .start_step(&id, StepType::Execution, json!({}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn test_skipping_ahead_is_rejected() {
        let (machine, id) = machine();
        let err = machine
            .start_step(&id, StepType::Planning, json!({}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn test_all_steps_completed_completes_workflow() {
        let (machine, id) = machine();
        advance(&machine, &id, &StepType::ORDERED);

        let workflow = machine.get_workflow(&id).unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);

        let progress = machine.get_progress(&id).unwrap();
        assert_eq!(progress.completed, 5);
        assert_eq!(progress.total, 5);
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(progress.current_step_type, None);
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let (machine, id) = machine();
        let err = machine
            .complete_step(&id, StepType::Request, json!({}))
            .unwrap_err();
        assert!(matches!(err, CoreError::StepNotInProgress { .. }));
    }

    #[test]
    fn test_cancel_skips_exactly_the_remaining_steps() {
        let (machine, id) = machine();
        advance(
            &machine,
            &id,
            &[StepType::Request, StepType::Planning, StepType::Validation],
        );

        machine.cancel_workflow(&id, "user abort").unwrap();

        let workflow = machine.get_workflow(&id).unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Cancelled);
        let skipped: Vec<_> = workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .map(|s| s.step_type)
            .collect();
        assert_eq!(skipped, vec![StepType::Execution, StepType::Result]);

        let err = machine.cancel_workflow(&id, "again").unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn test_progress_reports_current_step() {
        let (machine, id) = machine();
        advance(&machine, &id, &[StepType::Request]);
        machine.start_step(&id, StepType::Planning, json!({})).unwrap();

        let progress = machine.get_progress(&id).unwrap();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.percentage, 20.0);
        assert_eq!(progress.current_step_type, Some(StepType::Planning));
    }

    #[test]
    fn test_unknown_workflow() {
        let machine = WorkflowStateMachine::default();
        let missing = WorkflowId("nope".to_string());
        assert!(matches!(
            machine.get_progress(&missing),
            Err(CoreError::WorkflowNotFound(_))
        ));
        assert!(matches!(
            machine.start_step(&missing, StepType::Request, json!({})),
            Err(CoreError::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn test_events_are_published() {
        let handler = Arc::new(RecordingHandler::default());
        let machine = WorkflowStateMachine::new(handler.clone());
        let id = machine.create_workflow(&SessionId::from("s-2"));
        machine.start_step(&id, StepType::Request, json!({})).unwrap();
        machine.fail_step(&id, StepType::Request, "bad input").unwrap();

        assert_eq!(
            *handler.events.lock(),
            vec![
                "workflow.created",
                "workflow.step_started",
                "workflow.step_failed",
                "workflow.failed"
            ]
        );
    }
}
