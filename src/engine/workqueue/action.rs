//! Tagged outcome of one state-handler invocation
//!
//! Exactly one variant per transition. `continue` requires a target state;
//! `retry` falls back to the entry state when no target is given. `skip`
//! and `noop` persist no state change: the run ends and the same state is
//! re-run on the next executor tick.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestAction {
    /// Move to another state, optionally carrying data forward
    Continue {
        /// Target state
        to: String,
        /// Payload handed to the next state as the previous action
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// Earliest time (RFC 3339) the target state may run
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },
    /// Re-run a state; the target defaults to the entry state
    Retry {
        /// Optional explicit target state
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    /// Terminal success
    Pass {
        /// Run result payload
        result: Value,
    },
    /// Terminal failure
    Fail {
        /// Optional failure message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Pass-through tick: nothing persisted, state re-runs next tick
    Skip,
    /// Seed action: nothing persisted, state re-runs next tick
    Noop,
}

impl TestAction {
    /// Move to `to`
    pub fn continue_to(to: impl Into<String>) -> Self {
        TestAction::Continue {
            to: to.into(),
            data: None,
            after: None,
        }
    }

    /// Move to `to`, carrying `data` forward
    pub fn continue_with(to: impl Into<String>, data: Value) -> Self {
        TestAction::Continue {
            to: to.into(),
            data: Some(data),
            after: None,
        }
    }

    /// Move to `to`, but not before `after`
    pub fn continue_after(to: impl Into<String>, after: chrono::DateTime<chrono::Utc>) -> Self {
        TestAction::Continue {
            to: to.into(),
            data: None,
            after: Some(after.to_rfc3339()),
        }
    }

    /// Retry the entry state
    pub fn retry() -> Self {
        TestAction::Retry { to: None }
    }

    /// Retry at an explicit state
    pub fn retry_at(to: impl Into<String>) -> Self {
        TestAction::Retry {
            to: Some(to.into()),
        }
    }

    /// Terminal success with a result payload
    pub fn pass(result: Value) -> Self {
        TestAction::Pass { result }
    }

    /// Terminal failure
    pub fn fail(message: impl Into<String>) -> Self {
        TestAction::Fail {
            message: Some(message.into()),
        }
    }

    /// Whether this action ends the run with a recorded outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestAction::Pass { .. } | TestAction::Fail { .. })
    }

    /// Whether this action persists no state change
    pub fn is_pass_through(&self) -> bool {
        matches!(self, TestAction::Skip | TestAction::Noop)
    }

    /// The delay gate of a `continue`, parsed, if any
    ///
    /// An unparsable timestamp is treated as no gate; the executor logs it.
    pub fn deferred_until(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            TestAction::Continue {
                after: Some(after), ..
            } => chrono::DateTime::parse_from_rfc3339(after)
                .ok()
                .map(|t| t.with_timezone(&chrono::Utc)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_tagged_encoding() {
        let action = TestAction::continue_with("find-old-record", json!({"user": "u1"}));
        let encoded = serde_json::to_value(&action).unwrap();
        assert_eq!(encoded["kind"], "continue");
        assert_eq!(encoded["to"], "find-old-record");
        assert_eq!(encoded["data"]["user"], "u1");

        let decoded: TestAction = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, action);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let encoded = serde_json::to_value(TestAction::retry()).unwrap();
        assert_eq!(encoded, json!({"kind": "retry"}));

        let encoded = serde_json::to_value(TestAction::continue_to("b")).unwrap();
        assert_eq!(encoded, json!({"kind": "continue", "to": "b"}));
    }

    #[test]
    fn test_delay_gate_roundtrips() {
        let when = chrono::Utc::now() + chrono::Duration::hours(1);
        let action = TestAction::continue_after("poll", when);

        let encoded = serde_json::to_value(&action).unwrap();
        assert_eq!(encoded["after"], when.to_rfc3339());

        let decoded: TestAction = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.deferred_until(), Some(when));
        assert_eq!(TestAction::continue_to("b").deferred_until(), None);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(TestAction::pass(json!({})).is_terminal());
        assert!(TestAction::fail("x").is_terminal());
        assert!(!TestAction::retry().is_terminal());
        assert!(!TestAction::Skip.is_terminal());
        assert!(TestAction::Skip.is_pass_through());
        assert!(TestAction::Noop.is_pass_through());
        assert!(!TestAction::continue_to("b").is_pass_through());
    }
}
