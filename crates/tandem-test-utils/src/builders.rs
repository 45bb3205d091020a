//! Builders for test data and test-sized configuration.

use serde_json::Value;
use std::collections::HashMap;

use tandem_core::{EngineConfig, InstructionProtocol, InstructionStep, UserRequest};

/// Protocol with `steps` plain-language steps numbered from 1
pub fn protocol_with_steps(objective: &str, steps: usize) -> InstructionProtocol {
    (1..=steps).fold(InstructionProtocol::new(objective), |protocol, n| {
        protocol.with_step(InstructionStep::new(
            n.to_string(),
            format!("carry out part {} of the objective", n),
            "",
        ))
    })
}

/// Engine configuration with short ticks, short delays and no jitter
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.tick_interval_ms = 10;
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config.retry.jitter = 0.0;
    config.circuit.reset_timeout_ms = 1000;
    config.coordinator.execution_timeout_ms = 5000;
    config.recovery.enabled = false;
    config.monitoring.enable_metrics = false;
    config
}

/// Builder for user requests
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    user: String,
    content: String,
    context: HashMap<String, Value>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new("test-user", "test request")
    }
}

impl RequestBuilder {
    /// Request from `user` with `content`
    pub fn new(user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            content: content.into(),
            context: HashMap::new(),
        }
    }

    /// Set the `priority` hint
    pub fn priority(self, hint: &str) -> Self {
        self.context("priority", Value::String(hint.to_string()))
    }

    /// Add a context entry
    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Finish the request
    pub fn build(self) -> UserRequest {
        UserRequest {
            user: self.user,
            content: self.content,
            context: self.context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_protocol_with_steps_numbers_from_one() {
        let protocol = protocol_with_steps("Sort the inbox", 3);
        let ids: Vec<&str> = protocol.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_fast_config_is_valid() {
        fast_config().validate().unwrap();
    }

    #[test]
    fn test_request_builder_sets_priority() {
        let request = RequestBuilder::new("lin", "triage").priority("high").build();
        assert_eq!(request.context_str("priority"), Some("high"));
    }
}
