//! Priority scoring for incoming requests.

use crate::config::SchedulerConfig;
use crate::domain::session::UserRequest;

/// Lowest score a strategy may return
pub const MIN_PRIORITY: i32 = 0;
/// Highest score a strategy may return
pub const MAX_PRIORITY: i32 = 100;

/// Scores a request; higher runs first
pub trait PriorityStrategy: Send + Sync {
    /// Priority for `request`, within `MIN_PRIORITY..=MAX_PRIORITY`
    fn score(&self, request: &UserRequest) -> i32;
}

/// Base score adjusted by the `priority` context hint (`high` / `low`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintPriorityStrategy {
    base: i32,
    step: i32,
}

impl HintPriorityStrategy {
    /// Strategy with an explicit base and step
    pub fn new(base: i32, step: i32) -> Self {
        Self { base, step }
    }

    /// Strategy configured from the scheduler section
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.base_priority, config.priority_step)
    }
}

impl Default for HintPriorityStrategy {
    fn default() -> Self {
        Self::new(50, 20)
    }
}

impl PriorityStrategy for HintPriorityStrategy {
    fn score(&self, request: &UserRequest) -> i32 {
        let adjustment = match request
            .context_str("priority")
            .map(|p| p.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("high") => self.step,
            Some("low") => -self.step,
            _ => 0,
        };
        (self.base + adjustment).clamp(MIN_PRIORITY, MAX_PRIORITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hint_adjusts_base() {
        let strategy = HintPriorityStrategy::default();
        let plain = UserRequest::new("u", "x");
        let high = UserRequest::new("u", "x").with_context("priority", json!("HIGH"));
        let low = UserRequest::new("u", "x").with_context("priority", json!("low"));
        let odd = UserRequest::new("u", "x").with_context("priority", json!("whenever"));

        assert_eq!(strategy.score(&plain), 50);
        assert_eq!(strategy.score(&high), 70);
        assert_eq!(strategy.score(&low), 30);
        assert_eq!(strategy.score(&odd), 50);
    }

    #[test]
    fn test_score_is_clamped() {
        let strategy = HintPriorityStrategy::new(95, 20);
        let high = UserRequest::new("u", "x").with_context("priority", json!("high"));
        assert_eq!(strategy.score(&high), MAX_PRIORITY);
    }
}
