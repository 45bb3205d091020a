/// Workflow aggregate and step models
pub mod workflow;

/// Domain events
pub mod events;

/// Role liveness state
pub mod actor;

/// Role operations validated by the boundary enforcer
pub mod operation;

/// Sessions, requests and coordination results
pub mod session;

/// Payloads exchanged with the planning and execution roles
pub mod protocol;

/// Collaborator interfaces
pub mod ports;
