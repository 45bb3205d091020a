use crate::domain::actor::ActorRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse category an operation verb maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    /// Deciding what to do
    Plan,
    /// Doing it
    Execute,
}

impl OperationCategory {
    /// Category owned by a role
    pub fn owned_by(role: ActorRole) -> Self {
        match role {
            ActorRole::Planning => OperationCategory::Plan,
            ActorRole::Execution => OperationCategory::Execute,
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationCategory::Plan => f.write_str("plan"),
            OperationCategory::Execute => f.write_str("execute"),
        }
    }
}

/// Unit of work validated by the boundary enforcer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Role requesting the operation
    pub role: ActorRole,
    /// Free-form verb, e.g. `analyze` or `deploy`
    pub operation_type: String,
    /// Human readable description
    pub description: String,
    /// When the operation was requested
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    /// New operation stamped with the current time
    pub fn new(
        role: ActorRole,
        operation_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            role,
            operation_type: operation_type.into(),
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    /// Category the verb maps to, if it is a known verb
    pub fn category(&self) -> Option<OperationCategory> {
        crate::boundary::categorize(&self.operation_type)
    }
}
