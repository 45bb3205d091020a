//! Testing utilities for the Tandem coordination engine.
//!
//! Mocks of the collaborator ports, scripted fakes that fail a set number
//! of times before succeeding, and builders for protocols, requests and
//! test-sized engine configurations.

pub mod builders;
pub mod fakes;
pub mod mocks;

/// Re-export commonly used types for convenience
pub use mockall;

pub use builders::{fast_config, protocol_with_steps, RequestBuilder};
pub use fakes::{ScriptedExecutor, ScriptedPlanner};
pub use mocks::{MockAuditSink, MockExecutionCollaborator, MockPlanningCollaborator, MockProtocolValidator};
pub use tandem_monitoring::init_test_tracing;
