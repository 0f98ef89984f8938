//! Normalized stream event envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event category.
///
/// The four categories the run connector subscribes to are explicit
/// variants; anything else (`values`, `messages`, `metadata`, `end`, ...)
/// keeps its wire name in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StreamEventKind {
    Message,
    WorkflowProgress,
    WorkflowComplete,
    Error,
    Other(String),
}

impl StreamEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            StreamEventKind::Message => "message",
            StreamEventKind::WorkflowProgress => "workflow-progress",
            StreamEventKind::WorkflowComplete => "workflow-complete",
            StreamEventKind::Error => "error",
            StreamEventKind::Other(name) => name,
        }
    }
}

impl From<&str> for StreamEventKind {
    fn from(name: &str) -> Self {
        match name {
            // SSE frames without an explicit event name are generic messages
            "" | "message" => StreamEventKind::Message,
            "workflow-progress" => StreamEventKind::WorkflowProgress,
            "workflow-complete" => StreamEventKind::WorkflowComplete,
            "error" => StreamEventKind::Error,
            other => StreamEventKind::Other(other.to_string()),
        }
    }
}

impl From<String> for StreamEventKind {
    fn from(name: String) -> Self {
        StreamEventKind::from(name.as_str())
    }
}

impl From<StreamEventKind> for String {
    fn from(kind: StreamEventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{ type, data }` envelope delivered to callbacks and the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,

    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub fn new(kind: impl Into<StreamEventKind>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            StreamEventKind::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Payload that failed to parse, reported instead of raised
    pub fn parse_error(category: &StreamEventKind, raw: &str) -> Self {
        Self::new(
            StreamEventKind::Error,
            serde_json::json!({
                "error": "Error parsing event",
                "category": category.as_str(),
                "raw": raw,
            }),
        )
    }

    pub fn is_error(&self) -> bool {
        self.kind == StreamEventKind::Error
    }

    /// `messages` array, when present
    pub fn messages(&self) -> Option<&Value> {
        self.data.get("messages").filter(|m| m.is_array())
    }

    /// `ui_elements`, looked up under `values` first and then at the top
    /// level for `values`-mode events whose payload is the values object
    pub fn ui_elements(&self) -> Option<&Value> {
        self.data
            .get("values")
            .and_then(|v| v.get("ui_elements"))
            .or_else(|| {
                if self.kind.as_str() == "values" {
                    self.data.get("ui_elements")
                } else {
                    None
                }
            })
            .filter(|v| !v.is_null())
    }

    /// Human readable error message of an error event
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        let msg = match &self.data {
            Value::String(s) => s.clone(),
            Value::Object(o) => o
                .get("message")
                .or_else(|| o.get("error"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| self.data.to_string()),
            other => other.to_string(),
        };
        Some(msg)
    }
}

/// Terminal-condition heuristic.
///
/// Matches an event whose type contains `end`, a payload reporting
/// `status: "completed"`, or a payload carrying a run id together with
/// `completed: true`. This is not a protocol guarantee of the service.
pub fn is_terminal_event(event: &StreamEvent) -> bool {
    if event.kind.as_str().contains("end") {
        return true;
    }
    let data = &event.data;
    if data.get("status").and_then(Value::as_str) == Some("completed") {
        return true;
    }
    data.get("run_id").is_some_and(|v| !v.is_null())
        && data.get("completed").and_then(Value::as_bool) == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_roundtrip() {
        for name in ["message", "workflow-progress", "workflow-complete", "error", "values"] {
            let kind = StreamEventKind::from(name);
            assert_eq!(kind.as_str(), name);
        }
        assert_eq!(StreamEventKind::from(""), StreamEventKind::Message);
    }

    #[test]
    fn test_event_serialization() {
        let ev = StreamEvent::new("workflow-progress", json!({"step": 2}));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v, json!({"type": "workflow-progress", "data": {"step": 2}}));
        let back: StreamEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back.kind, StreamEventKind::WorkflowProgress);
    }

    #[test]
    fn test_terminal_heuristic() {
        assert!(is_terminal_event(&StreamEvent::new("end", Value::Null)));
        assert!(is_terminal_event(&StreamEvent::new("run-ended", json!({}))));
        assert!(is_terminal_event(&StreamEvent::new(
            "values",
            json!({"status": "completed"})
        )));
        assert!(is_terminal_event(&StreamEvent::new(
            "message",
            json!({"run_id": "R1", "completed": true})
        )));
        assert!(!is_terminal_event(&StreamEvent::new(
            "message",
            json!({"completed": true})
        )));
        assert!(!is_terminal_event(&StreamEvent::new(
            "values",
            json!({"status": "running", "run_id": "R1"})
        )));
    }

    #[test]
    fn test_ui_elements_lookup() {
        let nested = StreamEvent::new("updates", json!({"values": {"ui_elements": {"a": 1}}}));
        assert_eq!(nested.ui_elements(), Some(&json!({"a": 1})));

        let values_mode = StreamEvent::new("values", json!({"ui_elements": {"b": 2}}));
        assert_eq!(values_mode.ui_elements(), Some(&json!({"b": 2})));

        let other = StreamEvent::new("message", json!({"ui_elements": {"b": 2}}));
        assert!(other.ui_elements().is_none());
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            StreamEvent::error("boom").error_message().as_deref(),
            Some("boom")
        );
        let parse = StreamEvent::parse_error(&StreamEventKind::Message, "{oops");
        assert_eq!(parse.error_message().as_deref(), Some("Error parsing event"));
        assert_eq!(parse.data["raw"], "{oops");
        assert!(StreamEvent::new("values", json!({})).error_message().is_none());
    }
}
