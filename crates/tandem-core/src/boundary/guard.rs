//! Name-level capability guard.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::capabilities;
use crate::domain::actor::ActorRole;
use crate::{CoreError, CoreResult};

/// Operations a role exposes by name
#[async_trait]
pub trait RoleCapability: Send + Sync {
    /// Role behind the capability
    fn role(&self) -> ActorRole;

    /// Invoke a named operation
    async fn invoke(&self, operation: &str, input: Value) -> CoreResult<Value>;
}

/// Reject `operation` if its name contains one of the role's forbidden verbs.
pub fn check_operation_name(role: ActorRole, operation: &str) -> CoreResult<()> {
    let name = operation.to_ascii_lowercase();
    match capabilities(role)
        .forbidden
        .iter()
        .find(|verb| name.contains(*verb))
    {
        Some(verb) => {
            warn!(role = %role, operation = %operation, verb = %verb, "Capability guard rejected call");
            Err(CoreError::BoundaryViolation {
                role: role.to_string(),
                operation: operation.to_string(),
                category: verb.to_string(),
            })
        }
        None => Ok(()),
    }
}

/// Decorator that checks every invocation name before delegating
#[derive(Debug, Clone)]
pub struct CapabilityGuard<T> {
    inner: T,
}

impl<T: RoleCapability> CapabilityGuard<T> {
    /// Guard `inner`
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// The wrapped capability
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Unwrap the guard
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: RoleCapability> RoleCapability for CapabilityGuard<T> {
    fn role(&self) -> ActorRole {
        self.inner.role()
    }

    async fn invoke(&self, operation: &str, input: Value) -> CoreResult<Value> {
        check_operation_name(self.inner.role(), operation)?;
        self.inner.invoke(operation, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlanner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RoleCapability for CountingPlanner {
        fn role(&self) -> ActorRole {
            ActorRole::Planning
        }

        async fn invoke(&self, operation: &str, input: Value) -> CoreResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "operation": operation, "input": input }))
        }
    }

    fn guarded() -> CapabilityGuard<CountingPlanner> {
        CapabilityGuard::new(CountingPlanner {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_allowed_name_is_delegated() {
        let guard = guarded();
        let out = guard.invoke("analyzeRequirements", json!(1)).await.unwrap();
        assert_eq!(out["operation"], "analyzeRequirements");
        assert_eq!(guard.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forbidden_substring_is_rejected_before_delegating() {
        let guard = guarded();
        for name in ["deployService", "runMigration", "autoImplementFix"] {
            let err = guard.invoke(name, Value::Null).await.unwrap_err();
            assert!(matches!(err, CoreError::BoundaryViolation { .. }), "{name}");
        }
        assert_eq!(guard.inner().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_collaborator_entry_points_pass_their_own_guard() {
        check_operation_name(ActorRole::Planning, "generate_instructions").unwrap();
        check_operation_name(ActorRole::Execution, "execute_instructions").unwrap();
        assert!(check_operation_name(ActorRole::Execution, "plan_next_steps").is_err());
    }
}
