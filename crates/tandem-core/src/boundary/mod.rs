//! Role boundary enforcement.
//!
//! The planning role decides and the execution role acts; neither may do the
//! other's work. [`BoundaryEnforcer`] checks operations against each role's
//! capability set and scans produced content for the other role's
//! signatures. [`guard::CapabilityGuard`] adds a name-level check in front of
//! any role capability.

pub mod guard;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::domain::actor::ActorRole;
use crate::domain::operation::{Operation, OperationCategory};
use crate::domain::ports::{AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use crate::{CoreError, CoreResult};
use tandem_monitoring::CoordinationMetrics;

/// Verbs a role may and may not perform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleCapabilities {
    /// Allowed verbs
    pub allowed: &'static [&'static str],
    /// Forbidden verbs
    pub forbidden: &'static [&'static str],
}

const PLANNING_VERBS: &[&str] = &["analyze", "plan", "decide", "strategize"];
const EXECUTION_VERBS: &[&str] = &["execute", "implement", "run", "deploy"];

/// Capability set of a role; the two roles mirror each other
pub fn capabilities(role: ActorRole) -> RoleCapabilities {
    match role {
        ActorRole::Planning => RoleCapabilities {
            allowed: PLANNING_VERBS,
            forbidden: EXECUTION_VERBS,
        },
        ActorRole::Execution => RoleCapabilities {
            allowed: EXECUTION_VERBS,
            forbidden: PLANNING_VERBS,
        },
    }
}

/// Verb to category lookup
const CATEGORY_TABLE: &[(&str, OperationCategory)] = &[
    ("analyze", OperationCategory::Plan),
    ("plan", OperationCategory::Plan),
    ("decide", OperationCategory::Plan),
    ("strategize", OperationCategory::Plan),
    ("design", OperationCategory::Plan),
    ("evaluate", OperationCategory::Plan),
    ("generate_instructions", OperationCategory::Plan),
    ("execute", OperationCategory::Execute),
    ("implement", OperationCategory::Execute),
    ("run", OperationCategory::Execute),
    ("deploy", OperationCategory::Execute),
    ("build", OperationCategory::Execute),
    ("install", OperationCategory::Execute),
    ("execute_instructions", OperationCategory::Execute),
];

/// Map an operation verb to its coarse category
pub fn categorize(operation_type: &str) -> Option<OperationCategory> {
    let verb = operation_type.trim().to_ascii_lowercase();
    CATEGORY_TABLE
        .iter()
        .find(|(name, _)| *name == verb)
        .map(|(_, category)| *category)
}

lazy_static! {
    // Execution-role signatures that must not show up in planning output
    static ref EXECUTION_SIGNATURES: Vec<Regex> = vec![
        Regex::new(r"\bfunction\s+\w+\s*\([^)]*\)\s*\{?").unwrap(),
        Regex::new(r"\b(def|fn)\s+\w+\s*\([^)]*\)").unwrap(),
        Regex::new(r"\bclass\s+\w+\s*(\([^)]*\))?\s*[:{]").unwrap(),
        Regex::new(r"\b(npm|pip|pip3|cargo|yarn|brew|apt|apt-get)\s+install\b[^\n]*").unwrap(),
        Regex::new(r"\b(kubectl\s+apply|docker\s+(run|push)|terraform\s+apply|helm\s+install)\b[^\n]*").unwrap(),
        Regex::new(r"(?i)\b(CREATE|ALTER|DROP)\s+(TABLE|INDEX|DATABASE|SCHEMA|VIEW)\b[^\n;]*").unwrap(),
        Regex::new(r"\bsudo\s+\S+[^\n]*").unwrap(),
    ];

    // Planning-role language that must not show up in execution output
    static ref PLANNING_SIGNATURES: Vec<Regex> = vec![
        Regex::new(r"(?i)\bpros\s+and\s+cons\b").unwrap(),
        Regex::new(r"(?i)\balternative\s+approach(es)?\b").unwrap(),
        Regex::new(r"(?i)\bwe\s+should\s+consider\b").unwrap(),
        Regex::new(r"(?i)\btrade-?offs?\b").unwrap(),
        Regex::new(r"(?i)\bI\s+(would\s+)?recommend\b").unwrap(),
        Regex::new(r"(?i)\b(the\s+)?best\s+strategy\b").unwrap(),
    ];
}

/// What kind of boundary was crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Forbidden operation category
    Operation,
    /// Forbidden content
    Content,
}

/// One recorded boundary violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Offending role
    pub role: ActorRole,
    /// Kind of violation
    pub kind: ViolationKind,
    /// Operation verb or offending fragments
    pub details: Vec<String>,
    /// When it was detected
    pub timestamp: DateTime<Utc>,
}

/// Validates that operations and content stay on the right side of the role boundary
pub struct BoundaryEnforcer {
    violations: Mutex<HashMap<ActorRole, Vec<ViolationRecord>>>,
    audit: Arc<dyn AuditSink>,
    metrics: Option<CoordinationMetrics>,
}

impl Default for BoundaryEnforcer {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

impl BoundaryEnforcer {
    /// Create an enforcer reporting to `audit`
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            violations: Mutex::new(HashMap::new()),
            audit,
            metrics: None,
        }
    }

    /// Also count violations in `metrics`
    pub fn with_metrics(mut self, metrics: CoordinationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Check an operation against its role's capability set.
    ///
    /// Unknown verbs are rejected as well; a role may only do what it can
    /// name.
    pub async fn validate_operation(&self, operation: &Operation) -> CoreResult<OperationCategory> {
        let role = operation.role;
        let category = operation.category();

        let owned = OperationCategory::owned_by(role);
        if category == Some(owned) {
            return Ok(owned);
        }

        let category_name = category.map_or_else(|| "unclassified".to_string(), |c| c.to_string());
        let error = CoreError::BoundaryViolation {
            role: role.to_string(),
            operation: operation.operation_type.clone(),
            category: category_name.clone(),
        };

        warn!(
            role = %role,
            operation = %operation.operation_type,
            category = %category_name,
            "Operation boundary violation"
        );
        self.record(
            role,
            ViolationKind::Operation,
            vec![operation.operation_type.clone()],
            json!({
                "operation": operation.operation_type,
                "category": category_name,
                "description": operation.description,
            }),
        )
        .await;

        Err(error)
    }

    /// Scan `text` produced by `role` for the opposite role's signatures.
    ///
    /// Every match is collected into a single violation.
    pub async fn validate_content(&self, text: &str, role: ActorRole) -> CoreResult<()> {
        let fragments = scan_content(text, role);
        if fragments.is_empty() {
            return Ok(());
        }

        warn!(role = %role, count = fragments.len(), "Content boundary violation");
        self.record(
            role,
            ViolationKind::Content,
            fragments.clone(),
            json!({ "violations": fragments }),
        )
        .await;

        Err(CoreError::ContentBoundaryViolation {
            role: role.to_string(),
            violations: fragments,
        })
    }

    /// Violations recorded for a role, oldest first
    pub fn violations(&self, role: ActorRole) -> Vec<ViolationRecord> {
        self.violations
            .lock()
            .get(&role)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of violations across both roles
    pub fn violation_count(&self) -> usize {
        self.violations.lock().values().map(Vec::len).sum()
    }

    async fn record(
        &self,
        role: ActorRole,
        kind: ViolationKind,
        details: Vec<String>,
        metadata: serde_json::Value,
    ) {
        self.violations
            .lock()
            .entry(role)
            .or_default()
            .push(ViolationRecord {
                role,
                kind,
                details,
                timestamp: Utc::now(),
            });

        if let Some(metrics) = &self.metrics {
            metrics.record_boundary_violation(role.as_str());
        }

        let operation = match kind {
            ViolationKind::Operation => "validate_operation",
            ViolationKind::Content => "validate_content",
        };
        self.audit
            .log_event(AuditEvent::new(
                role.as_str(),
                operation,
                AuditOutcome::Violation,
                metadata,
            ))
            .await;
    }
}

/// Every fragment in `text` that belongs to the role opposite `role`
pub fn scan_content(text: &str, role: ActorRole) -> Vec<String> {
    let signatures: &[Regex] = match role {
        ActorRole::Planning => &EXECUTION_SIGNATURES,
        ActorRole::Execution => &PLANNING_SIGNATURES,
    };

    let mut fragments: Vec<String> = Vec::new();
    for pattern in signatures {
        for found in pattern.find_iter(text) {
            let fragment = found.as_str().trim().to_string();
            if !fragments.contains(&fragment) {
                fragments.push(fragment);
            }
        }
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::memory::MemoryAuditSink;

    fn enforcer() -> (BoundaryEnforcer, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        (BoundaryEnforcer::new(audit.clone()), audit)
    }

    #[tokio::test]
    async fn test_allowed_pairings_pass() {
        let (enforcer, _) = enforcer();
        for verb in PLANNING_VERBS {
            let op = Operation::new(ActorRole::Planning, *verb, "planning work");
            assert_eq!(
                enforcer.validate_operation(&op).await.unwrap(),
                OperationCategory::Plan
            );
        }
        for verb in EXECUTION_VERBS {
            let op = Operation::new(ActorRole::Execution, *verb, "execution work");
            assert_eq!(
                enforcer.validate_operation(&op).await.unwrap(),
                OperationCategory::Execute
            );
        }
        assert_eq!(enforcer.violation_count(), 0);
    }

    #[tokio::test]
    async fn test_crossed_pairings_are_violations() {
        let (enforcer, audit) = enforcer();

        let err = enforcer
            .validate_operation(&Operation::new(ActorRole::Planning, "execute", "sneaky"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BoundaryViolation { ref category, .. } if category == "execute"));

        let err = enforcer
            .validate_operation(&Operation::new(ActorRole::Execution, "plan", "sneaky"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BoundaryViolation { .. }));

        assert_eq!(enforcer.violations(ActorRole::Planning).len(), 1);
        assert_eq!(enforcer.violations(ActorRole::Execution).len(), 1);
        assert_eq!(audit.events_with(AuditOutcome::Violation).len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_verb_is_rejected() {
        let (enforcer, _) = enforcer();
        let err = enforcer
            .validate_operation(&Operation::new(ActorRole::Planning, "exfiltrate", ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unclassified"));
    }

    #[tokio::test]
    async fn test_code_in_planning_output() {
        let (enforcer, _) = enforcer();
        let text = "Step 1: write function foo() { return 1 }\nStep 2: npm install left-pad";

        let err = enforcer
            .validate_content(text, ActorRole::Planning)
            .await
            .unwrap_err();
        match err {
            CoreError::ContentBoundaryViolation { role, violations } => {
                assert_eq!(role, "planning");
                assert_eq!(violations.len(), 2);
                assert!(violations[0].starts_with("function foo()"));
                assert_eq!(violations[1], "npm install left-pad");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(enforcer.violations(ActorRole::Planning)[0].kind, ViolationKind::Content);
    }

    #[tokio::test]
    async fn test_strategy_language_in_execution_output() {
        let (enforcer, _) = enforcer();
        let text = "Weighing the pros and cons, we should consider an alternative approach.";

        let err = enforcer
            .validate_content(text, ActorRole::Execution)
            .await
            .unwrap_err();
        match err {
            CoreError::ContentBoundaryViolation { violations, .. } => {
                assert_eq!(
                    violations,
                    vec!["pros and cons", "alternative approach", "we should consider"]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_content_passes() {
        let (enforcer, _) = enforcer();
        enforcer
            .validate_content("Gather the figures and summarise them", ActorRole::Planning)
            .await
            .unwrap();
        enforcer
            .validate_content("Wrote summary.md with 3 sections", ActorRole::Execution)
            .await
            .unwrap();
    }

    #[test]
    fn test_ddl_is_an_execution_signature() {
        let fragments = scan_content("Then CREATE TABLE users (id int)", ActorRole::Planning);
        assert_eq!(fragments, vec!["CREATE TABLE users (id int)"]);
    }
}
