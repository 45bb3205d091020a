//! Actor coordinator
//!
//! Drives one session through the planning and execution phases. Each phase
//! marks its role busy, checks the role boundary, calls the collaborator
//! through the retry executor (falling back to the recovery manager), checks
//! what came back and records every step on the workflow.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::boundary::{guard::check_operation_name, BoundaryEnforcer};
use crate::config::CoordinatorConfig;
use crate::domain::actor::{ActorRole, ActorState, ActorStatus};
use crate::domain::operation::Operation;
use crate::domain::ports::{
    AuditEvent, AuditOutcome, AuditSink, ExecutionCollaborator, PlanningCollaborator, ProtocolValidator,
};
use crate::domain::protocol::{ExecutionContext, ExecutionOutcome, InstructionProtocol};
use crate::domain::session::{CoordinationResult, CorrelationId, Session, SessionId, UserRequest};
use crate::domain::workflow::{StepStatus, StepType, WorkflowId};
use crate::resilience::{CircuitKey, CircuitStatus, RecoveryManager, ResilientExecutor};
use crate::workflow::WorkflowStateMachine;
use crate::{CoreError, CoreResult};
use tandem_monitoring::CoordinationMetrics;

/// Planning collaborator entry point
pub const GENERATE_INSTRUCTIONS: &str = "generate_instructions";
/// Execution collaborator entry point
pub const EXECUTE_INSTRUCTIONS: &str = "execute_instructions";

/// Marker for a session currently inside `process_request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveOperation {
    /// Session being processed
    pub session_id: SessionId,
    /// Workflow tracking it
    pub workflow_id: WorkflowId,
    /// Correlation id of the call
    pub correlation_id: CorrelationId,
    /// When processing started
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Health of one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorHealth {
    /// Role
    pub role: ActorRole,
    /// Current status
    pub status: ActorStatus,
    /// Whether a collaborator is bound
    pub bound: bool,
    /// Bound and not errored
    pub healthy: bool,
    /// Last failure message
    pub last_error: Option<String>,
}

/// Health of both roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorHealth {
    /// Both roles healthy
    pub healthy: bool,
    /// Per-role detail
    pub actors: Vec<ActorHealth>,
}

/// Drives planning then execution for a session
pub struct ActorCoordinator {
    config: CoordinatorConfig,
    planning: RwLock<Option<Arc<dyn PlanningCollaborator>>>,
    execution: RwLock<Option<Arc<dyn ExecutionCollaborator>>>,
    workflows: Arc<WorkflowStateMachine>,
    boundary: Arc<BoundaryEnforcer>,
    executor: Arc<ResilientExecutor>,
    recovery: Option<Arc<RecoveryManager>>,
    validator: Arc<dyn ProtocolValidator>,
    audit: Arc<dyn AuditSink>,
    metrics: Option<CoordinationMetrics>,
    actors: Mutex<HashMap<ActorRole, ActorState>>,
    active: Mutex<HashMap<SessionId, ActiveOperation>>,
}

impl ActorCoordinator {
    /// Create a coordinator; collaborators are bound with [`initialize`](Self::initialize).
    ///
    /// Passing `None` for `recovery` leaves collaborator failures to the
    /// retry executor alone.
    pub fn new(
        config: CoordinatorConfig,
        workflows: Arc<WorkflowStateMachine>,
        boundary: Arc<BoundaryEnforcer>,
        executor: Arc<ResilientExecutor>,
        recovery: Option<Arc<RecoveryManager>>,
        validator: Arc<dyn ProtocolValidator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let actors = ActorRole::ALL
            .iter()
            .map(|role| (*role, ActorState::new(*role)))
            .collect();

        Self {
            config,
            planning: RwLock::new(None),
            execution: RwLock::new(None),
            workflows,
            boundary,
            executor,
            recovery,
            validator,
            audit,
            metrics: None,
            actors: Mutex::new(actors),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Also publish phase metrics to `metrics`
    pub fn with_metrics(mut self, metrics: CoordinationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind the two roles
    pub fn initialize(
        &self,
        planning: Arc<dyn PlanningCollaborator>,
        execution: Arc<dyn ExecutionCollaborator>,
    ) {
        *self.planning.write() = Some(planning);
        *self.execution.write() = Some(execution);
        info!("Coordinator initialized with planning and execution collaborators");
    }

    /// Run one session through every workflow step.
    ///
    /// The active-operation marker is cleared whether or not the call succeeds.
    #[instrument(skip(self, session, request), fields(session_id = %session.id))]
    pub async fn process_request(
        &self,
        session: &Session,
        request: &UserRequest,
    ) -> CoreResult<CoordinationResult> {
        let workflow_id = match &session.workflow_id {
            Some(id) => id.clone(),
            None => self.workflows.create_workflow(&session.id),
        };
        let correlation_id = CorrelationId::generate();

        self.active.lock().insert(
            session.id.clone(),
            ActiveOperation {
                session_id: session.id.clone(),
                workflow_id: workflow_id.clone(),
                correlation_id: correlation_id.clone(),
                started_at: chrono::Utc::now(),
            },
        );
        info!(workflow_id = %workflow_id, correlation_id = %correlation_id, "Processing request");

        let result = self
            .run_phases(&session.id, &workflow_id, &correlation_id, request)
            .await;

        if let Err(err) = &result {
            self.fail_open_step(&workflow_id, err);
            error!(
                workflow_id = %workflow_id,
                correlation_id = %correlation_id,
                error = %err,
                "Request processing failed"
            );
        }

        self.active.lock().remove(&session.id);
        result
    }

    async fn run_phases(
        &self,
        session_id: &SessionId,
        workflow_id: &WorkflowId,
        correlation_id: &CorrelationId,
        request: &UserRequest,
    ) -> CoreResult<CoordinationResult> {
        let started = Instant::now();

        self.workflows
            .start_step(workflow_id, StepType::Request, serde_json::to_value(request)?)?;
        self.workflows.complete_step(
            workflow_id,
            StepType::Request,
            json!({ "session_id": session_id, "correlation_id": correlation_id }),
        )?;

        let planning_started = Instant::now();
        let instructions = self
            .phase(
                ActorRole::Planning,
                GENERATE_INSTRUCTIONS,
                session_id,
                correlation_id,
                self.planning_phase(workflow_id, request),
            )
            .await?;
        let planning_duration_ms = elapsed_ms(planning_started);

        let execution_started = Instant::now();
        let context = ExecutionContext {
            session_id: session_id.clone(),
            workflow_id: workflow_id.clone(),
            correlation_id: correlation_id.clone(),
            timeout_ms: self.config.execution_timeout_ms,
        };
        let outcome = self
            .phase(
                ActorRole::Execution,
                EXECUTE_INSTRUCTIONS,
                session_id,
                correlation_id,
                self.execution_phase(workflow_id, &instructions, &context),
            )
            .await?;
        let execution_duration_ms = elapsed_ms(execution_started);

        self.workflows.start_step(
            workflow_id,
            StepType::Result,
            json!({ "instructions": instructions.steps.len() }),
        )?;
        let result = outcome.into_session_result(instructions.steps.len());
        self.workflows
            .complete_step(workflow_id, StepType::Result, serde_json::to_value(&result)?)?;

        let total_duration_ms = elapsed_ms(started);
        info!(
            workflow_id = %workflow_id,
            planning_ms = planning_duration_ms,
            execution_ms = execution_duration_ms,
            total_ms = total_duration_ms,
            "Request processed"
        );

        Ok(CoordinationResult {
            correlation_id: correlation_id.clone(),
            session_id: session_id.clone(),
            workflow_id: workflow_id.clone(),
            result,
            planning_duration_ms,
            execution_duration_ms,
            total_duration_ms,
        })
    }

    /// Planning and validation steps
    async fn planning_phase(
        &self,
        workflow_id: &WorkflowId,
        request: &UserRequest,
    ) -> CoreResult<InstructionProtocol> {
        self.workflows.start_step(
            workflow_id,
            StepType::Planning,
            json!({ "user": request.user, "content": request.content }),
        )?;

        self.boundary
            .validate_operation(&Operation::new(
                ActorRole::Planning,
                "plan",
                format!("Generate instructions for workflow {}", workflow_id),
            ))
            .await?;
        if self.config.enforce_capability_guard {
            check_operation_name(ActorRole::Planning, GENERATE_INSTRUCTIONS)?;
        }

        let planner = self
            .planning
            .read()
            .clone()
            .ok_or_else(|| CoreError::ActorUnavailable("planning collaborator is not bound".to_string()))?;

        let limit = self.config.planning_timeout_ms.map(Duration::from_millis);
        let attempt = || {
            let planner = planner.clone();
            async move {
                bounded(limit, "planning", async move { planner.generate_instructions(request).await }).await
            }
        };
        let instructions = self
            .resilient_call(ActorRole::Planning, GENERATE_INSTRUCTIONS, &attempt)
            .await?;

        self.workflows.complete_step(
            workflow_id,
            StepType::Planning,
            serde_json::to_value(&instructions)?,
        )?;

        self.workflows.start_step(
            workflow_id,
            StepType::Validation,
            json!({ "protocol_id": instructions.id }),
        )?;
        self.boundary
            .validate_content(&instructions.render_text(), ActorRole::Planning)
            .await?;
        self.validator.validate(&instructions).await?;
        self.validator.ensure_no_code(&instructions).await?;
        self.workflows.complete_step(
            workflow_id,
            StepType::Validation,
            json!({ "valid": true, "steps": instructions.steps.len() }),
        )?;

        Ok(instructions)
    }

    /// Execution step
    async fn execution_phase(
        &self,
        workflow_id: &WorkflowId,
        instructions: &InstructionProtocol,
        context: &ExecutionContext,
    ) -> CoreResult<ExecutionOutcome> {
        self.workflows.start_step(
            workflow_id,
            StepType::Execution,
            json!({ "protocol_id": instructions.id, "timeout_ms": context.timeout_ms }),
        )?;

        self.boundary
            .validate_operation(&Operation::new(
                ActorRole::Execution,
                "execute",
                format!("Execute {} instruction(s)", instructions.steps.len()),
            ))
            .await?;
        if self.config.enforce_capability_guard {
            check_operation_name(ActorRole::Execution, EXECUTE_INSTRUCTIONS)?;
        }

        let executor = self
            .execution
            .read()
            .clone()
            .ok_or_else(|| CoreError::ActorUnavailable("execution collaborator is not bound".to_string()))?;

        let limit = Some(Duration::from_millis(context.timeout_ms));
        let attempt = || {
            let executor = executor.clone();
            async move {
                bounded(limit, "execution", async move {
                    executor.execute_instructions(instructions, context).await
                })
                .await
            }
        };
        let outcome = self
            .resilient_call(ActorRole::Execution, EXECUTE_INSTRUCTIONS, &attempt)
            .await?;

        self.boundary
            .validate_content(&outcome.render_text(), ActorRole::Execution)
            .await?;
        if !outcome.success {
            return Err(CoreError::external(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "Execution reported failure".to_string()),
            ));
        }

        self.workflows.complete_step(
            workflow_id,
            StepType::Execution,
            json!({
                "summary": outcome.summary,
                "output": outcome.output,
                "artifacts": outcome.artifacts,
            }),
        )?;
        Ok(outcome)
    }

    /// Retry executor first, then the recovery strategy for whatever it gave up on
    async fn resilient_call<T, F, Fut>(&self, role: ActorRole, operation: &str, attempt: &F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let error = match self.executor.execute(role, operation, attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let recovery = match (&self.recovery, &error) {
            (_, CoreError::CircuitOpen { .. }) | (None, _) => return Err(error),
            (Some(recovery), _) => recovery,
        };
        let key = CircuitKey::new(role, operation);
        if self.executor.breaker().status(&key) == CircuitStatus::Open {
            debug!(circuit = %key, code = %error.code(), "Circuit opened, skipping recovery");
            return Err(error);
        }

        debug!(role = %role, operation, code = %error.code(), "Handing failure to recovery");
        let executor = &self.executor;
        recovery
            .recover(error, move || executor.execute(role, operation, attempt))
            .await
            .into_result()
    }

    /// Mark the role busy, run `work`, then record the outcome on the role
    async fn phase<T, Fut>(
        &self,
        role: ActorRole,
        operation: &str,
        session_id: &SessionId,
        correlation_id: &CorrelationId,
        work: Fut,
    ) -> CoreResult<T>
    where
        Fut: Future<Output = CoreResult<T>>,
    {
        {
            let mut actors = self.actors.lock();
            let state = actors
                .get_mut(&role)
                .ok_or_else(|| CoreError::ActorUnavailable(role.to_string()))?;
            if !state.is_idle() {
                return Err(CoreError::ActorUnavailable(format!(
                    "{} role is {}",
                    role, state.status
                )));
            }
            state.begin(operation);
        }

        let started = Instant::now();
        let result = work.await;
        let duration_ms = elapsed_ms(started);

        if let Some(state) = self.actors.lock().get_mut(&role) {
            match &result {
                Ok(_) => state.succeed(duration_ms),
                Err(e) => state.fail(&e.to_string(), duration_ms),
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_phase(role.as_str(), result.is_ok(), duration_ms as f64);
        }

        let (outcome, metadata) = match &result {
            Ok(_) => (
                AuditOutcome::Success,
                json!({
                    "session_id": session_id,
                    "correlation_id": correlation_id,
                    "duration_ms": duration_ms,
                }),
            ),
            Err(e) => (
                AuditOutcome::Failure,
                json!({
                    "session_id": session_id,
                    "correlation_id": correlation_id,
                    "duration_ms": duration_ms,
                    "code": e.code(),
                    "error": e.to_string(),
                }),
            ),
        };
        self.audit
            .log_event(AuditEvent::new(role.as_str(), operation, outcome, metadata))
            .await;

        result
    }

    /// Fail whichever step the error interrupted; a workflow that is already
    /// terminal (cancelled meanwhile) is left alone.
    /// Clean up after a request whose processing stopped without returning:
    /// busy roles become errored, the open step fails and the active marker
    /// is cleared.
    pub fn abandon_request(&self, session_id: &SessionId, workflow_id: &WorkflowId, reason: &str) {
        for state in self.actors.lock().values_mut() {
            if state.status == ActorStatus::Busy {
                warn!(role = %state.role, reason, "Role abandoned mid-operation");
                state.fail(reason, 0);
            }
        }
        self.fail_open_step(workflow_id, &CoreError::Other(reason.to_string()));
        self.active.lock().remove(session_id);
    }

    fn fail_open_step(&self, workflow_id: &WorkflowId, err: &CoreError) {
        let workflow = match self.workflows.get_workflow(workflow_id) {
            Ok(workflow) => workflow,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "Cannot record failure");
                return;
            }
        };
        if workflow.status.is_terminal() {
            debug!(workflow_id = %workflow_id, status = ?workflow.status, "Workflow already terminal");
            return;
        }

        let step = workflow
            .current_step()
            .or_else(|| workflow.steps.iter().find(|s| s.status == StepStatus::Pending))
            .map(|s| s.step_type);
        if let Some(step) = step {
            if let Err(e) = self.workflows.fail_step(workflow_id, step, err.to_string()) {
                warn!(workflow_id = %workflow_id, step = %step, error = %e, "Cannot fail step");
            }
        }
    }

    /// Both roles bound and idle
    pub fn are_actors_available(&self) -> bool {
        let bound = self.planning.read().is_some() && self.execution.read().is_some();
        bound && self.actors.lock().values().all(ActorState::is_idle)
    }

    /// Each role is healthy unless errored or unbound
    pub fn health_check(&self) -> CoordinatorHealth {
        let planning_bound = self.planning.read().is_some();
        let execution_bound = self.execution.read().is_some();
        let actors = self.actors.lock();

        let actors: Vec<ActorHealth> = ActorRole::ALL
            .iter()
            .filter_map(|role| actors.get(role))
            .map(|state| {
                let bound = match state.role {
                    ActorRole::Planning => planning_bound,
                    ActorRole::Execution => execution_bound,
                };
                ActorHealth {
                    role: state.role,
                    status: state.status,
                    bound,
                    healthy: bound && state.status != ActorStatus::Error,
                    last_error: state.last_error.clone(),
                }
            })
            .collect();

        CoordinatorHealth {
            healthy: actors.iter().all(|a| a.healthy),
            actors,
        }
    }

    /// Return an errored role to idle. Returns whether the role was errored.
    pub fn reset_actor(&self, role: ActorRole) -> bool {
        let mut actors = self.actors.lock();
        match actors.get_mut(&role) {
            Some(state) if state.status == ActorStatus::Error => {
                state.reset();
                info!(role = %role, "Actor reset to idle");
                true
            }
            _ => false,
        }
    }

    /// Reset every errored role
    pub fn reset_errored_actors(&self) -> Vec<ActorRole> {
        ActorRole::ALL
            .iter()
            .copied()
            .filter(|role| self.reset_actor(*role))
            .collect()
    }

    /// State of one role
    pub fn actor_state(&self, role: ActorRole) -> Option<ActorState> {
        self.actors.lock().get(&role).cloned()
    }

    /// State of both roles, planning first
    pub fn actor_states(&self) -> Vec<ActorState> {
        let actors = self.actors.lock();
        ActorRole::ALL
            .iter()
            .filter_map(|role| actors.get(role).cloned())
            .collect()
    }

    /// Sessions currently inside `process_request`
    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        self.active.lock().values().cloned().collect()
    }

    /// Workflow state machine in use
    pub fn workflows(&self) -> &Arc<WorkflowStateMachine> {
        &self.workflows
    }

    /// Boundary enforcer in use
    pub fn boundary(&self) -> &Arc<BoundaryEnforcer> {
        &self.boundary
    }

    /// Retry executor in use
    pub fn executor(&self) -> &Arc<ResilientExecutor> {
        &self.executor
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Await `work`, failing with a timeout error once `limit` has passed
async fn bounded<T, Fut>(limit: Option<Duration>, what: &str, work: Fut) -> CoreResult<T>
where
    Fut: Future<Output = CoreResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
            CoreError::Timeout(format!("{} timed out after {}ms", what, limit.as_millis()))
        })?,
        None => work.await,
    }
}
