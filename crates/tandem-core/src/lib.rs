//!
//! Tandem Core - two-role coordination engine
//!
//! Drives a user request through a fixed workflow (request, planning,
//! validation, execution, result) while keeping the planning role and the
//! execution role inside their own capability sets, and wrapping every
//! collaborator call with retry, circuit breaking and categorized recovery.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - sessions, workflows, roles and collaborator ports
pub mod domain;

/// Workflow state machine
pub mod workflow;

/// Role boundary enforcement
pub mod boundary;

/// Retry, circuit breaking and recovery
pub mod resilience;

/// Drives a session through both roles
pub mod coordinator;

/// Priority backlog
pub mod scheduler;

/// Engine facade and tick loop
pub mod engine;

/// Engine configuration
pub mod config;

/// Error types
pub mod error;

pub use error::{CoreError, CoreResult};

pub use boundary::guard::{CapabilityGuard, RoleCapability};
pub use boundary::BoundaryEnforcer;
pub use config::{CoordinatorConfig, EngineConfig, SchedulerConfig};
pub use coordinator::{ActorCoordinator, CoordinatorHealth};
pub use domain::actor::{ActorRole, ActorState, ActorStatus};
pub use domain::operation::{Operation, OperationCategory};
pub use domain::ports::{
    AuditEvent, AuditOutcome, AuditSink, ExecutionCollaborator, PlanningCollaborator, ProtocolValidator,
    StructuralProtocolValidator, TracingAuditSink,
};
pub use domain::protocol::{ExecutionContext, ExecutionOutcome, InstructionProtocol, InstructionStep};
pub use domain::session::{
    CoordinationResult, CorrelationId, Session, SessionId, SessionResult, SessionStatus, UserRequest,
};
pub use domain::workflow::{StepStatus, StepType, Workflow, WorkflowId, WorkflowProgress, WorkflowStatus};
pub use engine::{CoordinationEngine, EngineBuilder, EngineMetrics, HealthReport, SessionStatusReport};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitStatus, ErrorCode, RecoveryManager, RecoveryStrategy,
    ResilientExecutor, RetryPolicy,
};
pub use scheduler::{HintPriorityStrategy, PriorityStrategy, RequestScheduler};
pub use workflow::WorkflowStateMachine;
