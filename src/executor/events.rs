// ABOUTME: Structured events produced by a streaming execution
// ABOUTME: Data events wrap one decoded output record; error events terminate the stream

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item of a streaming execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A record decoded from one line of output
    Data {
        /// The decoded record
        payload: Value,
    },

    /// The process failed or the transport broke; always the last event
    Error {
        /// Human-readable description
        message: String,
        /// Process exit code, when the process exited
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<u32>,
        /// Collected stderr, when there was any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
}

/// Token counts reported by `usage` and `result` records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed
    pub input_tokens: u64,
    /// Tokens generated
    pub output_tokens: u64,
}

impl ExecutionEvent {
    /// Wrap a decoded record
    pub fn data(payload: Value) -> Self {
        Self::Data { payload }
    }

    /// A terminal error without process details
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    /// Whether this is the terminal failure event
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The decoded record of a data event
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Data { payload } => Some(payload),
            Self::Error { .. } => None,
        }
    }

    /// The record's `type` field
    pub fn event_type(&self) -> Option<&str> {
        self.payload()?.get("type")?.as_str()
    }

    /// Session identifier announced by a `system` record
    pub fn session_id(&self) -> Option<&str> {
        self.system_field("session_id")
    }

    /// Model announced by a `system` record
    pub fn model(&self) -> Option<&str> {
        self.system_field("model")
    }

    /// Token usage from a `usage` or `result` record
    pub fn usage(&self) -> Option<TokenUsage> {
        let payload = self.payload()?;
        if !matches!(self.event_type(), Some("usage" | "result")) {
            return None;
        }
        let usage = payload.get("usage")?;
        let count = |field: &str| usage.get(field).and_then(Value::as_u64).unwrap_or(0);
        Some(TokenUsage {
            input_tokens: count("input_tokens"),
            output_tokens: count("output_tokens"),
        })
    }

    fn system_field(&self, field: &str) -> Option<&str> {
        if self.event_type()? != "system" {
            return None;
        }
        self.payload()?.get(field)?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_system_record_helpers() {
        let event = ExecutionEvent::data(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "abc-123",
            "model": "claude-sonnet-4-6"
        }));
        assert_eq!(event.event_type(), Some("system"));
        assert_eq!(event.session_id(), Some("abc-123"));
        assert_eq!(event.model(), Some("claude-sonnet-4-6"));
        assert_eq!(event.usage(), None);
    }

    #[test]
    fn test_session_id_only_from_system_records() {
        let event = ExecutionEvent::data(json!({"type": "assistant", "session_id": "abc"}));
        assert_eq!(event.session_id(), None);
    }

    #[test]
    fn test_usage_from_result_record() {
        let event = ExecutionEvent::data(json!({
            "type": "result",
            "usage": {"input_tokens": 120, "output_tokens": 45}
        }));
        assert_eq!(
            event.usage(),
            Some(TokenUsage {
                input_tokens: 120,
                output_tokens: 45
            })
        );

        let partial = ExecutionEvent::data(json!({"type": "usage", "usage": {"output_tokens": 3}}));
        assert_eq!(partial.usage().map(|u| u.input_tokens), Some(0));
    }

    #[test]
    fn test_error_event_wire_shape() {
        let event = ExecutionEvent::Error {
            message: "Command failed (exit code 7): boom".to_string(),
            exit_code: Some(7),
            stderr: Some("boom".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "kind": "error",
                "message": "Command failed (exit code 7): boom",
                "exit_code": 7,
                "stderr": "boom"
            })
        );
        assert!(event.is_error());
        assert_eq!(event.event_type(), None);
    }
}
