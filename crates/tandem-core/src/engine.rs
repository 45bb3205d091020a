//! Coordination engine
//!
//! Facade over the scheduler and the coordinator. Requests are submitted to
//! the backlog; a fixed-period tick admits the next one when both roles are
//! available and runs it on a spawned task.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::boundary::BoundaryEnforcer;
use crate::config::EngineConfig;
use crate::coordinator::{ActorCoordinator, CoordinatorHealth};
use crate::domain::events::{DomainEventHandler, TracingEventHandler};
use crate::domain::ports::{
    AuditSink, ExecutionCollaborator, PlanningCollaborator, ProtocolValidator, StructuralProtocolValidator,
    TracingAuditSink,
};
use crate::domain::session::{Session, SessionId, SessionResult, SessionStatus, UserRequest};
use crate::domain::workflow::{WorkflowId, WorkflowProgress};
use crate::resilience::{
    CircuitBreaker, CircuitSnapshot, RecoveryManager, RecoveryMetrics, ResilienceMetrics, ResilientExecutor,
};
use crate::scheduler::{HintPriorityStrategy, PriorityStrategy, QueueItem, RequestScheduler, SchedulerStats};
use crate::workflow::WorkflowStateMachine;
use crate::{CoreError, CoreResult};
use tandem_monitoring::CoordinationMetrics;

/// Status of one session as seen by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusReport {
    /// Session
    pub session_id: SessionId,
    /// Current status
    pub status: SessionStatus,
    /// 1-based backlog position while queued
    pub queue_position: Option<usize>,
    /// Workflow progress once admitted
    pub progress: Option<WorkflowProgress>,
    /// Result of a completed session
    pub result: Option<SessionResult>,
    /// Error of a failed session
    pub error: Option<String>,
}

/// Backlog section of the health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealth {
    /// Requests waiting
    pub backlog: usize,
    /// Session holding the processing slot
    pub processing: Option<SessionId>,
    /// Counts per status
    pub stats: SchedulerStats,
}

/// Engine health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Both roles healthy
    pub healthy: bool,
    /// Whether the tick loop is running
    pub running: bool,
    /// Per-role health
    pub actors: CoordinatorHealth,
    /// Backlog state
    pub queue: QueueHealth,
    /// Every circuit seen so far
    pub circuits: Vec<CircuitSnapshot>,
}

/// Session outcome counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Sessions that completed
    pub successful: u64,
    /// Sessions that failed
    pub failed: u64,
    /// Sessions cancelled by a caller
    pub cancelled: u64,
    /// Mean processing latency of completed and failed sessions
    pub average_latency_ms: f64,
}

impl SessionCounters {
    fn record(&mut self, success: bool, latency_ms: f64) {
        let previous = self.successful + self.failed;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.average_latency_ms =
            (self.average_latency_ms * previous as f64 + latency_ms) / (previous + 1) as f64;
    }
}

/// Engine-wide metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    /// Session outcomes
    pub sessions: SessionCounters,
    /// Retry and circuit counters
    pub resilience: ResilienceMetrics,
    /// Recovery counters, when recovery is enabled
    pub recovery: Option<RecoveryMetrics>,
    /// Boundary violations recorded
    pub boundary_violations: usize,
    /// Requests waiting
    pub backlog: usize,
}

/// Builds a [`CoordinationEngine`] with optional replacements for the
/// default validator, audit sink, metrics, priority strategy and event handler.
pub struct EngineBuilder {
    config: EngineConfig,
    validator: Option<Arc<dyn ProtocolValidator>>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<CoordinationMetrics>,
    priority: Option<Arc<dyn PriorityStrategy>>,
    event_handler: Option<Arc<dyn DomainEventHandler>>,
    recovery: Option<RecoveryManager>,
}

impl EngineBuilder {
    /// Builder over `config`
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            validator: None,
            audit: None,
            metrics: None,
            priority: None,
            event_handler: None,
            recovery: None,
        }
    }

    /// Protocol validator used after planning
    pub fn validator(mut self, validator: Arc<dyn ProtocolValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Audit sink for phases and violations
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Metrics sink, used even when `monitoring.enable_metrics` is off
    pub fn metrics(mut self, metrics: CoordinationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Priority strategy for submitted requests
    pub fn priority_strategy(mut self, strategy: Arc<dyn PriorityStrategy>) -> Self {
        self.priority = Some(strategy);
        self
    }

    /// Receiver of workflow events
    pub fn event_handler(mut self, handler: Arc<dyn DomainEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Recovery manager replacing the one built from `config.recovery`
    pub fn recovery(mut self, recovery: RecoveryManager) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Validate the configuration, wire the components and bind both roles
    pub fn build(
        self,
        planning: Arc<dyn PlanningCollaborator>,
        execution: Arc<dyn ExecutionCollaborator>,
    ) -> CoreResult<CoordinationEngine> {
        let config = self.config;
        config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => Some(metrics),
            None if config.monitoring.enable_metrics => Some(CoordinationMetrics::default()),
            None => None,
        };

        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(StructuralProtocolValidator));
        let handler = self
            .event_handler
            .unwrap_or_else(|| Arc::new(TracingEventHandler));
        let priority = self
            .priority
            .unwrap_or_else(|| Arc::new(HintPriorityStrategy::from_config(&config.scheduler)));

        let recovery = match (config.recovery.enabled, self.recovery) {
            (false, _) => None,
            (true, Some(recovery)) => Some(Arc::new(recovery)),
            (true, None) => Some(Arc::new(RecoveryManager::from_config(&config.recovery)?)),
        };

        let mut boundary = BoundaryEnforcer::new(audit.clone());
        let mut executor = ResilientExecutor::new(config.retry.clone(), CircuitBreaker::new(config.circuit.clone()));
        if let Some(metrics) = &metrics {
            boundary = boundary.with_metrics(metrics.clone());
            executor = executor.with_metrics(metrics.clone());
        }

        let mut coordinator = ActorCoordinator::new(
            config.coordinator.clone(),
            Arc::new(WorkflowStateMachine::new(handler)),
            Arc::new(boundary),
            Arc::new(executor),
            recovery.clone(),
            validator,
            audit,
        );
        if let Some(metrics) = &metrics {
            coordinator = coordinator.with_metrics(metrics.clone());
        }
        coordinator.initialize(planning, execution);

        let (shutdown, _) = watch::channel(false);
        info!(
            tick_interval_ms = config.scheduler.tick_interval_ms,
            recovery = recovery.is_some(),
            metrics = metrics.is_some(),
            "Coordination engine built"
        );

        Ok(CoordinationEngine {
            config,
            scheduler: RequestScheduler::new(priority),
            coordinator,
            recovery,
            metrics,
            counters: Mutex::new(SessionCounters::default()),
            sessions: Mutex::new(HashMap::new()),
            shutdown,
            running: Mutex::new(false),
        })
    }
}

/// Accepts requests and drives them one at a time through both roles
pub struct CoordinationEngine {
    config: EngineConfig,
    scheduler: RequestScheduler,
    coordinator: ActorCoordinator,
    recovery: Option<Arc<RecoveryManager>>,
    metrics: Option<CoordinationMetrics>,
    counters: Mutex<SessionCounters>,
    sessions: Mutex<HashMap<SessionId, WorkflowId>>,
    shutdown: watch::Sender<bool>,
    running: Mutex<bool>,
}

/// Releases a session whose task unwound or was dropped before it recorded an outcome
struct Unfinished<'a> {
    engine: &'a CoordinationEngine,
    session_id: &'a SessionId,
    workflow_id: &'a WorkflowId,
    started: Instant,
    armed: bool,
}

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if self.armed {
            let latency_ms = self.started.elapsed().as_millis() as f64;
            self.engine
                .release_unfinished(self.session_id, self.workflow_id, latency_ms);
        }
    }
}

impl CoordinationEngine {
    /// Engine with default collaborators around the two roles
    pub fn new(
        config: EngineConfig,
        planning: Arc<dyn PlanningCollaborator>,
        execution: Arc<dyn ExecutionCollaborator>,
    ) -> CoreResult<Self> {
        EngineBuilder::new(config).build(planning, execution)
    }

    /// Start building an engine
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Queue a request; returns its session id
    pub fn submit_request(
        &self,
        user: impl Into<String>,
        content: impl Into<String>,
        context: HashMap<String, Value>,
    ) -> SessionId {
        let session_id = self.scheduler.submit(user, content, context);
        self.publish_backlog();
        session_id
    }

    /// Queue an already built request
    pub fn submit(&self, request: UserRequest) -> SessionId {
        let session_id = self.scheduler.submit_request(request);
        self.publish_backlog();
        session_id
    }

    /// Status, backlog position, progress and outcome of a session
    pub fn get_session_status(&self, session_id: &SessionId) -> CoreResult<SessionStatusReport> {
        let item = self
            .scheduler
            .item(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;

        let progress = self
            .workflow_for(session_id)
            .and_then(|workflow_id| self.coordinator.workflows().get_progress(&workflow_id).ok());

        Ok(SessionStatusReport {
            session_id: item.session_id,
            status: item.status,
            queue_position: self.scheduler.queue_position(session_id),
            progress,
            result: item.result,
            error: item.error,
        })
    }

    /// Roles, backlog and circuits
    pub fn get_health_status(&self) -> HealthReport {
        let actors = self.coordinator.health_check();
        HealthReport {
            healthy: actors.healthy,
            running: *self.running.lock(),
            actors,
            queue: QueueHealth {
                backlog: self.scheduler.backlog_len(),
                processing: self.scheduler.processing(),
                stats: self.scheduler.stats(),
            },
            circuits: self.coordinator.executor().circuits(),
        }
    }

    /// Session, resilience and recovery counters
    pub fn get_metrics(&self) -> EngineMetrics {
        EngineMetrics {
            sessions: self.counters.lock().clone(),
            resilience: self.coordinator.executor().metrics(),
            recovery: self.recovery.as_ref().map(|r| r.metrics()),
            boundary_violations: self.coordinator.boundary().violation_count(),
            backlog: self.scheduler.backlog_len(),
        }
    }

    /// Cancel a queued or running session.
    ///
    /// A running session's workflow is cancelled; its remaining steps are
    /// skipped and the coordinator stops at the next step boundary.
    pub fn cancel_session(&self, session_id: &SessionId) -> CoreResult<()> {
        let previous = self.scheduler.cancel(session_id)?;
        self.counters.lock().cancelled += 1;

        if previous == SessionStatus::Processing {
            if let Some(workflow_id) = self.workflow_for(session_id) {
                if let Err(e) = self
                    .coordinator
                    .workflows()
                    .cancel_workflow(&workflow_id, "Cancelled by request")
                {
                    warn!(session_id = %session_id, workflow_id = %workflow_id, error = %e, "Cannot cancel workflow");
                }
            }
        }
        self.publish_backlog();
        Ok(())
    }

    /// Admit the next request, if any, and run it to completion.
    ///
    /// Returns the admitted session. A no-op while a session is processing
    /// or either role is unavailable.
    pub async fn tick(&self) -> Option<SessionId> {
        let item = self.admit()?;
        let session_id = item.session_id.clone();
        self.run_admitted(item).await;
        Some(session_id)
    }

    /// Spawn the fixed-period tick loop. Admitted sessions run on their own
    /// task, so a long session never delays the tick.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_millis(self.config.scheduler.tick_interval_ms);
        *self.running.lock() = true;
        info!(tick_interval_ms = period.as_millis() as u64, "Engine started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Option<JoinHandle<()>> = None;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(item) = engine.admit() {
                            let runner = Arc::clone(&engine);
                            in_flight = Some(tokio::spawn(async move {
                                runner.run_admitted(item).await;
                            }));
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            if let Some(handle) = in_flight {
                if let Err(e) = handle.await {
                    error!(error = %e, "Session task ended abnormally");
                }
            }
            *engine.running.lock() = false;
            info!("Engine stopped");
        })
    }

    /// Stop the tick loop; a running session is allowed to finish
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!(backlog = self.scheduler.backlog_len(), "Engine shutdown requested");
    }

    /// Workflow created for a session once it was admitted
    pub fn workflow_for(&self, session_id: &SessionId) -> Option<WorkflowId> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// The coordinator driving both roles
    pub fn coordinator(&self) -> &ActorCoordinator {
        &self.coordinator
    }

    /// The request scheduler
    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn admit(&self) -> Option<QueueItem> {
        let item = self
            .scheduler
            .try_admit(self.coordinator.are_actors_available())?;
        self.publish_backlog();
        Some(item)
    }

    async fn run_admitted(&self, item: QueueItem) {
        let session_id = item.session_id.clone();
        let workflow_id = self.coordinator.workflows().create_workflow(&session_id);
        self.sessions
            .lock()
            .insert(session_id.clone(), workflow_id.clone());

        let mut unfinished = Unfinished {
            engine: self,
            session_id: &session_id,
            workflow_id: &workflow_id,
            started: Instant::now(),
            armed: true,
        };
        let session = Session::new(session_id.clone()).with_workflow(workflow_id.clone());
        let outcome = self.coordinator.process_request(&session, &item.request).await;
        unfinished.armed = false;
        let latency_ms = unfinished.started.elapsed().as_millis() as f64;

        let failed = outcome.is_err();
        let recorded = match outcome {
            Ok(result) => self.scheduler.mark_completed(&session_id, result.result),
            Err(e) => self.scheduler.mark_failed(&session_id, e.to_string()),
        };
        if let Err(e) = recorded {
            warn!(session_id = %session_id, error = %e, "Cannot record session outcome");
        }

        match self.scheduler.status(&session_id) {
            Some(SessionStatus::Completed) => self.record_outcome(true, latency_ms),
            Some(SessionStatus::Failed) => self.record_outcome(false, latency_ms),
            status => debug!(session_id = %session_id, status = ?status, "Session finished without outcome"),
        }

        if failed && self.config.coordinator.auto_reset_actors {
            let reset = self.coordinator.reset_errored_actors();
            if !reset.is_empty() {
                info!(session_id = %session_id, roles = ?reset, "Errored roles reset after failed session");
            }
        }
    }

    fn release_unfinished(&self, session_id: &SessionId, workflow_id: &WorkflowId, latency_ms: f64) {
        const REASON: &str = "Session processing stopped before completion";

        error!(session_id = %session_id, "Session task ended abnormally, releasing its slot");
        self.coordinator.abandon_request(session_id, workflow_id, REASON);
        match self.scheduler.mark_failed(session_id, REASON) {
            Ok(()) if self.scheduler.status(session_id) == Some(SessionStatus::Failed) => {
                self.record_outcome(false, latency_ms)
            }
            Ok(()) => {}
            Err(e) => warn!(session_id = %session_id, error = %e, "Cannot record session outcome"),
        }
        if self.config.coordinator.auto_reset_actors {
            self.coordinator.reset_errored_actors();
        }
    }

    fn record_outcome(&self, success: bool, latency_ms: f64) {
        self.counters.lock().record(success, latency_ms);
        if let Some(metrics) = &self.metrics {
            metrics.record_session(success, latency_ms);
        }
    }

    fn publish_backlog(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_backlog_depth(self.scheduler.backlog_len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::memory::{EchoExecutor, MemoryAuditSink, StaticPlanner};
    use crate::domain::protocol::{InstructionProtocol, InstructionStep};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> CoordinationEngine {
        let protocol = InstructionProtocol::new("Tidy the changelog")
            .with_step(InstructionStep::new("1", "collect entries", ""));
        CoordinationEngine::builder(EngineConfig::default())
            .audit(Arc::new(MemoryAuditSink::new()))
            .build(Arc::new(StaticPlanner::new(protocol)), Arc::new(EchoExecutor))
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_processes_one_session() {
        let engine = engine();
        let first = engine.submit_request("ada", "tidy it", HashMap::new());
        let second = engine.submit_request("ada", "again", HashMap::new());

        let report = engine.get_session_status(&second).unwrap();
        assert_eq!(report.status, SessionStatus::Queued);
        assert_eq!(report.queue_position, Some(2));
        assert!(report.progress.is_none());

        assert_eq!(engine.tick().await, Some(first.clone()));
        let report = engine.get_session_status(&first).unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.progress.unwrap().percentage, 100.0);
        assert_eq!(report.result.unwrap().instructions_executed, 1);
        assert_eq!(engine.get_session_status(&second).unwrap().queue_position, Some(1));

        let metrics = engine.get_metrics();
        assert_eq!(metrics.sessions.successful, 1);
        assert_eq!(metrics.backlog, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_session() {
        let engine = engine();
        let session = engine.submit_request("ada", "x", HashMap::from([("priority".to_string(), json!("low"))]));
        engine.cancel_session(&session).unwrap();

        assert_eq!(engine.tick().await, None);
        let report = engine.get_session_status(&session).unwrap();
        assert_eq!(report.status, SessionStatus::Cancelled);
        assert_eq!(engine.get_metrics().sessions.cancelled, 1);
        assert!(engine.cancel_session(&session).is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let engine = engine();
        assert!(matches!(
            engine.get_session_status(&SessionId::from("nope")),
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_report_lists_roles_and_queue() {
        let engine = engine();
        engine.submit_request("ada", "x", HashMap::new());

        let health = engine.get_health_status();
        assert!(health.healthy);
        assert!(!health.running);
        assert_eq!(health.actors.actors.len(), 2);
        assert_eq!(health.queue.backlog, 1);
        assert!(health.circuits.is_empty());
    }

    #[tokio::test]
    async fn test_session_and_phase_metrics_are_published() {
        use tandem_monitoring::metrics::names;
        use tandem_monitoring::MemoryCollector;

        let collector = Arc::new(MemoryCollector::new());
        let engine = CoordinationEngine::builder(EngineConfig::default())
            .audit(Arc::new(MemoryAuditSink::new()))
            .metrics(CoordinationMetrics::new(collector.clone()))
            .build(
                Arc::new(StaticPlanner::new(
                    InstructionProtocol::new("Label issues").with_step(InstructionStep::new("1", "label", "")),
                )),
                Arc::new(EchoExecutor),
            )
            .unwrap();

        engine.submit_request("ada", "label them", HashMap::new());
        engine.tick().await;

        assert_eq!(collector.counter_total(names::SESSIONS_TOTAL), 1.0);
        assert_eq!(collector.counter_total(names::PHASES_TOTAL), 2.0);
        assert!(collector
            .snapshot()
            .iter()
            .any(|m| m.name == names::BACKLOG_DEPTH && m.value == 0.0));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.scheduler.tick_interval_ms = 0;
        let result = CoordinationEngine::new(
            config,
            Arc::new(StaticPlanner::new(InstructionProtocol::new("x"))),
            Arc::new(EchoExecutor),
        );
        assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
    }

    #[test]
    fn test_latency_average() {
        let mut counters = SessionCounters::default();
        counters.record(true, 100.0);
        counters.record(false, 300.0);
        assert_eq!(counters.successful, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.average_latency_ms, 200.0);
    }
}
