//! Checkpoint tokens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Snapshot of remote graph state at a pause point.
///
/// Treated as an opaque token: every field is echoed back on resume,
/// including the ones not modelled here.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub graph_state: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowCheckpoint {
    pub fn new(node_id: impl Into<String>, graph_state: Value) -> Self {
        Self {
            node_id: Some(node_id.into()),
            graph_state,
            extra: Map::new(),
        }
    }

    pub fn checkpoint_id(&self) -> Option<&str> {
        self.extra.get("checkpoint_id").and_then(Value::as_str)
    }
}

/// Checkpoint reference used in state writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    #[serde(default)]
    pub checkpoint_map: Map<String, Value>,
}

impl CheckpointRef {
    pub const UI_NAMESPACE: &'static str = "ui";

    /// Reference into the `ui` namespace with an empty checkpoint id
    pub fn ui(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: Self::UI_NAMESPACE.to_string(),
            checkpoint_id: String::new(),
            checkpoint_map: Map::new(),
        }
    }
}
