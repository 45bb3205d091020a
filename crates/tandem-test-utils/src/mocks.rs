//! Mock implementations of the collaborator ports.

use async_trait::async_trait;
use mockall::mock;

use tandem_core::domain::ports::{
    AuditEvent, AuditSink, ExecutionCollaborator, PlanningCollaborator, ProtocolValidator,
};
use tandem_core::{CoreResult, ExecutionContext, ExecutionOutcome, InstructionProtocol, UserRequest};

// Generate the mock implementation for PlanningCollaborator
mock! {
    pub PlanningCollaborator {}

    #[async_trait]
    impl PlanningCollaborator for PlanningCollaborator {
        async fn generate_instructions(&self, request: &UserRequest) -> CoreResult<InstructionProtocol>;
    }
}

// Generate the mock implementation for ExecutionCollaborator
mock! {
    pub ExecutionCollaborator {}

    #[async_trait]
    impl ExecutionCollaborator for ExecutionCollaborator {
        async fn execute_instructions(
            &self,
            instructions: &InstructionProtocol,
            context: &ExecutionContext,
        ) -> CoreResult<ExecutionOutcome>;
    }
}

// Generate the mock implementation for ProtocolValidator
mock! {
    pub ProtocolValidator {}

    #[async_trait]
    impl ProtocolValidator for ProtocolValidator {
        async fn validate(&self, instructions: &InstructionProtocol) -> CoreResult<()>;
        async fn ensure_no_code(&self, instructions: &InstructionProtocol) -> CoreResult<()>;
    }
}

// Generate the mock implementation for AuditSink
mock! {
    pub AuditSink {}

    #[async_trait]
    impl AuditSink for AuditSink {
        async fn log_event(&self, event: AuditEvent);
    }
}

/// Validator mock that accepts every protocol
pub fn accepting_validator() -> MockProtocolValidator {
    let mut validator = MockProtocolValidator::new();
    validator.expect_validate().returning(|_| Ok(()));
    validator.expect_ensure_no_code().returning(|_| Ok(()));
    validator
}

/// Audit sink mock that ignores every event
pub fn quiet_audit_sink() -> MockAuditSink {
    let mut audit = MockAuditSink::new();
    audit.expect_log_event().returning(|_| ());
    audit
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::InstructionStep;

    #[tokio::test]
    async fn test_planning_mock_returns_configured_protocol() {
        let mut planner = MockPlanningCollaborator::new();
        planner.expect_generate_instructions().times(1).returning(|request| {
            Ok(InstructionProtocol::new(format!("Plan for {}", request.user))
                .with_step(InstructionStep::new("1", "outline", "")))
        });

        let protocol = planner
            .generate_instructions(&UserRequest::new("grace", "outline it"))
            .await
            .unwrap();
        assert_eq!(protocol.objective, "Plan for grace");
    }

    #[tokio::test]
    async fn test_accepting_validator() {
        let validator = accepting_validator();
        let protocol = InstructionProtocol::new("x");
        assert!(validator.validate(&protocol).await.is_ok());
        assert!(validator.ensure_no_code(&protocol).await.is_ok());
    }
}
