//! Request scheduler
//!
//! Holds the backlog sorted by priority (descending, ties in arrival order)
//! and admits at most one request at a time, and only while both roles are
//! available.

pub mod priority;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::session::{SessionId, SessionResult, SessionStatus, UserRequest};
use crate::{CoreError, CoreResult};
pub use priority::{HintPriorityStrategy, PriorityStrategy};

/// One submitted request and its bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Session created for the request
    pub session_id: SessionId,
    /// The request itself
    pub request: UserRequest,
    /// Priority assigned at submission
    pub priority: i32,
    /// Arrival order
    pub sequence: u64,
    /// Current status
    pub status: SessionStatus,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Admission time
    pub started_at: Option<DateTime<Utc>>,
    /// Completion, failure or cancellation time
    pub finished_at: Option<DateTime<Utc>>,
    /// Result of a completed session
    pub result: Option<SessionResult>,
    /// Error message of a failed session
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct BacklogEntry {
    priority: i32,
    sequence: u64,
}

/// Counts per status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Waiting in the backlog
    pub queued: usize,
    /// Admitted and running
    pub processing: usize,
    /// Finished successfully
    pub completed: usize,
    /// Finished with an error
    pub failed: usize,
    /// Cancelled
    pub cancelled: usize,
}

#[derive(Default)]
struct SchedulerState {
    backlog: Vec<(BacklogEntry, SessionId)>,
    items: HashMap<SessionId, QueueItem>,
    processing: Option<SessionId>,
    next_sequence: u64,
}

/// Priority-ordered backlog admitting one request at a time
pub struct RequestScheduler {
    strategy: Arc<dyn PriorityStrategy>,
    state: Mutex<SchedulerState>,
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new(Arc::new(HintPriorityStrategy::default()))
    }
}

impl RequestScheduler {
    /// Scheduler scoring requests with `strategy`
    pub fn new(strategy: Arc<dyn PriorityStrategy>) -> Self {
        Self {
            strategy,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Queue a request built from its parts
    pub fn submit(
        &self,
        user: impl Into<String>,
        content: impl Into<String>,
        context: HashMap<String, Value>,
    ) -> SessionId {
        self.submit_request(UserRequest {
            user: user.into(),
            content: content.into(),
            context,
        })
    }

    /// Queue a request; returns its new session id
    pub fn submit_request(&self, request: UserRequest) -> SessionId {
        let priority = self.strategy.score(&request);
        let session_id = SessionId::generate();

        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let entry = BacklogEntry { priority, sequence };
        let index = state
            .backlog
            .partition_point(|(existing, _)| existing.priority >= priority);
        state.backlog.insert(index, (entry, session_id.clone()));

        state.items.insert(
            session_id.clone(),
            QueueItem {
                session_id: session_id.clone(),
                request,
                priority,
                sequence,
                status: SessionStatus::Queued,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            },
        );

        info!(
            session_id = %session_id,
            priority,
            position = index + 1,
            backlog = state.backlog.len(),
            "Request queued"
        );
        session_id
    }

    /// Admit the head of the backlog if nothing is processing, both roles
    /// are available and the backlog is non-empty.
    pub fn try_admit(&self, actors_available: bool) -> Option<QueueItem> {
        let mut state = self.state.lock();
        if state.processing.is_some() || !actors_available || state.backlog.is_empty() {
            return None;
        }

        let (entry, session_id) = state.backlog.remove(0);
        state.processing = Some(session_id.clone());

        let item = state.items.get_mut(&session_id)?;
        item.status = SessionStatus::Processing;
        item.started_at = Some(Utc::now());

        debug!(
            session_id = %session_id,
            priority = entry.priority,
            sequence = entry.sequence,
            "Request admitted"
        );
        Some(item.clone())
    }

    /// Record success and free the processing slot
    pub fn mark_completed(&self, session_id: &SessionId, result: SessionResult) -> CoreResult<()> {
        self.finish(session_id, |item| {
            item.status = SessionStatus::Completed;
            item.result = Some(result);
        })
    }

    /// Record failure and free the processing slot
    pub fn mark_failed(&self, session_id: &SessionId, error: impl Into<String>) -> CoreResult<()> {
        let error = error.into();
        self.finish(session_id, |item| {
            item.status = SessionStatus::Failed;
            item.error = Some(error);
        })
    }

    /// Cancel a session.
    ///
    /// A queued session leaves the backlog. A processing session is marked
    /// cancelled but keeps the processing slot until its run returns.
    pub fn cancel(&self, session_id: &SessionId) -> CoreResult<SessionStatus> {
        let mut state = self.state.lock();
        let previous = state
            .items
            .get(session_id)
            .map(|item| item.status)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;

        match previous {
            SessionStatus::Queued => {
                state.backlog.retain(|(_, id)| id != session_id);
            }
            SessionStatus::Processing => {}
            terminal => {
                return Err(CoreError::InvalidTransition(format!(
                    "Cannot cancel session {} in state {}",
                    session_id, terminal
                )))
            }
        }

        if let Some(item) = state.items.get_mut(session_id) {
            item.status = SessionStatus::Cancelled;
            item.finished_at = Some(Utc::now());
        }
        info!(session_id = %session_id, previous = %previous, "Session cancelled");
        Ok(previous)
    }

    /// 1-based position in the backlog, if queued
    pub fn queue_position(&self, session_id: &SessionId) -> Option<usize> {
        self.state
            .lock()
            .backlog
            .iter()
            .position(|(_, id)| id == session_id)
            .map(|p| p + 1)
    }

    /// Requests waiting in the backlog
    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    /// Status of a session
    pub fn status(&self, session_id: &SessionId) -> Option<SessionStatus> {
        self.state.lock().items.get(session_id).map(|item| item.status)
    }

    /// Snapshot of a session's bookkeeping
    pub fn item(&self, session_id: &SessionId) -> Option<QueueItem> {
        self.state.lock().items.get(session_id).cloned()
    }

    /// Session currently holding the processing slot
    pub fn processing(&self) -> Option<SessionId> {
        self.state.lock().processing.clone()
    }

    /// Backlog session ids in admission order
    pub fn backlog(&self) -> Vec<SessionId> {
        self.state
            .lock()
            .backlog
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Counts per status
    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let mut stats = SchedulerStats::default();
        for item in state.items.values() {
            match item.status {
                SessionStatus::Queued => stats.queued += 1,
                SessionStatus::Processing => stats.processing += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    fn finish<F>(&self, session_id: &SessionId, update: F) -> CoreResult<()>
    where
        F: FnOnce(&mut QueueItem),
    {
        let mut state = self.state.lock();
        if state.processing.as_ref() == Some(session_id) {
            state.processing = None;
        }

        let item = state
            .items
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;

        match item.status {
            SessionStatus::Processing => {
                update(item);
                item.finished_at = Some(Utc::now());
                Ok(())
            }
            // Cancelled while running; the cancellation stands
            SessionStatus::Cancelled => Ok(()),
            other => Err(CoreError::InvalidTransition(format!(
                "Cannot finish session {} in state {}",
                session_id, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn with_priority(hint: &str) -> HashMap<String, Value> {
        HashMap::from([("priority".to_string(), json!(hint))])
    }

    fn result() -> SessionResult {
        SessionResult {
            summary: "ok".to_string(),
            output: Value::Null,
            artifacts: vec![],
            instructions_executed: 1,
        }
    }

    #[test]
    fn test_backlog_orders_by_priority_then_arrival() {
        let scheduler = RequestScheduler::default();
        let a = scheduler.submit("u", "a", HashMap::new());
        let b = scheduler.submit("u", "b", with_priority("low"));
        let c = scheduler.submit("u", "c", with_priority("high"));
        let d = scheduler.submit("u", "d", HashMap::new());
        let e = scheduler.submit("u", "e", with_priority("high"));

        assert_eq!(scheduler.backlog(), vec![c.clone(), e.clone(), a.clone(), d.clone(), b.clone()]);
        assert_eq!(scheduler.queue_position(&a), Some(3));

        let mut admitted = Vec::new();
        while let Some(item) = scheduler.try_admit(true) {
            admitted.push(item.session_id.clone());
            scheduler.mark_completed(&item.session_id, result()).unwrap();
        }
        assert_eq!(admitted, vec![c, e, a, d, b]);
    }

    #[test]
    fn test_admits_one_at_a_time() {
        let scheduler = RequestScheduler::default();
        let first = scheduler.submit("u", "1", HashMap::new());
        let second = scheduler.submit("u", "2", HashMap::new());

        assert!(scheduler.try_admit(false).is_none());
        let item = scheduler.try_admit(true).unwrap();
        assert_eq!(item.session_id, first);
        assert_eq!(item.status, SessionStatus::Processing);
        assert!(scheduler.try_admit(true).is_none());
        assert_eq!(scheduler.queue_position(&second), Some(1));

        scheduler.mark_failed(&first, "boom").unwrap();
        assert_eq!(scheduler.status(&first), Some(SessionStatus::Failed));
        assert_eq!(scheduler.item(&first).unwrap().error.as_deref(), Some("boom"));

        // A failed session does not block the next one
        let next = scheduler.try_admit(true).unwrap();
        assert_eq!(next.session_id, second);
    }

    #[test]
    fn test_cancel_queued_and_processing() {
        let scheduler = RequestScheduler::default();
        let running = scheduler.submit("u", "1", HashMap::new());
        let waiting = scheduler.submit("u", "2", HashMap::new());
        scheduler.try_admit(true).unwrap();

        assert_eq!(scheduler.cancel(&waiting).unwrap(), SessionStatus::Queued);
        assert_eq!(scheduler.backlog_len(), 0);
        assert_eq!(scheduler.queue_position(&waiting), None);

        assert_eq!(scheduler.cancel(&running).unwrap(), SessionStatus::Processing);
        // Slot stays taken until the run reports back
        assert_eq!(scheduler.processing(), Some(running.clone()));
        scheduler.mark_completed(&running, result()).unwrap();
        assert_eq!(scheduler.status(&running), Some(SessionStatus::Cancelled));
        assert_eq!(scheduler.processing(), None);

        assert!(matches!(
            scheduler.cancel(&running),
            Err(CoreError::InvalidTransition(_))
        ));
        assert!(matches!(
            scheduler.cancel(&SessionId::from("missing")),
            Err(CoreError::SessionNotFound(_))
        ));

        let stats = scheduler.stats();
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.queued, 0);
    }
}
