//! Scripted collaborators.
//!
//! Each fake fails a configured number of times with a configured error,
//! then behaves like the in-memory collaborators of `tandem-core`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use tandem_core::domain::ports::{ExecutionCollaborator, PlanningCollaborator};
use tandem_core::{
    CoreError, CoreResult, ExecutionContext, ExecutionOutcome, InstructionProtocol, UserRequest,
};

/// Planner that fails a scripted number of times, then returns its protocol.
///
/// A request carrying a `fail` context key is always refused; one carrying a
/// `panic` context key panics mid-call.
pub struct ScriptedPlanner {
    protocol: InstructionProtocol,
    failures: Mutex<VecDeque<CoreError>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
    /// Planner that always succeeds with `protocol`
    pub fn new(protocol: InstructionProtocol) -> Self {
        Self {
            protocol,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` calls with `error`
    pub fn failing(self, times: usize, error: CoreError) -> Self {
        self.failures
            .lock()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    /// Number of calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Content of every request seen, in call order
    pub fn requests_seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl PlanningCollaborator for ScriptedPlanner {
    async fn generate_instructions(&self, request: &UserRequest) -> CoreResult<InstructionProtocol> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.content.clone());

        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        if request.context.contains_key("panic") {
            panic!("Planner crashed on: {}", request.content);
        }
        if request.context.contains_key("fail") {
            return Err(CoreError::external(format!("Planner refused: {}", request.content)));
        }
        Ok(self.protocol.clone())
    }
}

/// Executor that fails or stalls a scripted number of times, then succeeds
pub struct ScriptedExecutor {
    failures: Mutex<VecDeque<CoreError>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Instant>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// Executor that always succeeds immediately
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` calls with `error`
    pub fn failing(self, times: usize, error: CoreError) -> Self {
        self.failures
            .lock()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    /// Sleep for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls so far
    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Gaps between consecutive calls
    pub fn gaps(&self) -> Vec<Duration> {
        self.calls
            .lock()
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }
}

#[async_trait]
impl ExecutionCollaborator for ScriptedExecutor {
    async fn execute_instructions(
        &self,
        instructions: &InstructionProtocol,
        context: &ExecutionContext,
    ) -> CoreResult<ExecutionOutcome> {
        self.calls.lock().push(Instant::now());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let mut outcome = ExecutionOutcome::succeeded(
            format!("Completed: {}", instructions.objective),
            json!({
                "session_id": context.session_id,
                "steps": instructions.steps.len(),
            }),
        );
        outcome.artifacts = instructions
            .steps
            .iter()
            .map(|step| format!("step-{}.log", step.id))
            .collect();
        Ok(outcome)
    }
}
