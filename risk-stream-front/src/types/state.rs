//! Thread state, state writes and history entries.

use crate::types::checkpoint::CheckpointRef;
use crate::types::ids::{RunId, ThreadId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known keys of the workflow's `values`.
pub mod keys {
    pub const RISK_DATA: &str = "risk_data";
    pub const INPUT_FILE: &str = "input_file";
    pub const UI_ELEMENTS: &str = "ui_elements";
    pub const MESSAGES: &str = "messages";
    pub const THREAD_ID: &str = "thread_id";
}

/// Risk row field names produced by the workflow.
pub mod risk_fields {
    pub const ID: &str = "Id";
    pub const RISK: &str = "Risco";
    pub const CAUSES: &str = "Causas";
    pub const CONSEQUENCES: &str = "Consequencias";
    pub const PROBABILITY: &str = "Probabilidade";
    pub const OVERALL_IMPACT: &str = "Impacto Geral";
    pub const RISK_LEVEL: &str = "Nível de Risco";
    pub const RELATED_TO: &str = "Relacionado ao";
    pub const APPETITE_ANALYSIS: &str = "Análise de Apetite e Tolerância";
    pub const PREVENTIVE_ACTIONS: &str = "Ações Preventivas";
    pub const CONTINGENCY_ACTIONS: &str = "Ações de Contingência";
}

/// State of a thread, as returned by `GET /threads/{id}/state` and as
/// elements of `GET /threads/{id}/history`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreadState {
    #[serde(default)]
    pub values: Value,

    #[serde(default)]
    pub next: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint: Option<Value>,

    #[serde(default)]
    pub metadata: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type HistoryEntry = ThreadState;

impl ThreadState {
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.values
            .get(keys::THREAD_ID)
            .and_then(Value::as_str)
            .or_else(|| self.metadata.get("thread_id").and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(ThreadId::from)
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.metadata
            .get("run_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(RunId::from)
    }

    /// Checkpoint id of this entry (`checkpoint.checkpoint_id`)
    pub fn checkpoint_id(&self) -> Option<&str> {
        self.checkpoint
            .as_ref()
            .and_then(|c| c.get("checkpoint_id"))
            .and_then(Value::as_str)
    }

    /// Pending interrupts of the paused node, if any
    pub fn interrupts(&self) -> Vec<Value> {
        self.extra
            .get("tasks")
            .and_then(Value::as_array)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter_map(|t| t.get("interrupts").and_then(Value::as_array))
                    .flatten()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Latest `(thread_id, run_id)` from a most-recent-first history.
///
/// Only the newest entry is consulted; both ids must be present.
pub fn extract_thread_and_run_from_history(history: &[HistoryEntry]) -> Option<(ThreadId, RunId)> {
    let latest = history.first()?;
    match (latest.thread_id(), latest.run_id()) {
        (Some(thread_id), Some(run_id)) => Some((thread_id, run_id)),
        _ => {
            tracing::warn!("could not extract both thread id and run id from latest history entry");
            None
        }
    }
}

/// One `{key, value}` write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    pub key: String,
    pub value: Value,
}

impl StateValue {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Body of `POST /threads/{id}/state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub values: Vec<StateValue>,
    pub checkpoint: CheckpointRef,
    pub as_node: String,
}

impl StateUpdate {
    pub const DEFAULT_AS_NODE: &'static str = "ui_update";

    pub fn new(thread_id: &ThreadId, values: Vec<StateValue>) -> Self {
        Self {
            values,
            checkpoint: CheckpointRef::ui(thread_id.as_str()),
            as_node: Self::DEFAULT_AS_NODE.to_string(),
        }
    }

    pub fn as_node(mut self, node: impl Into<String>) -> Self {
        self.as_node = node.into();
        self
    }
}

/// Response of the file upload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub input_file: String,
}

impl UploadResponse {
    /// Path with Windows separators normalized to `/`
    pub fn normalized_path(&self) -> String {
        self.input_file.replace('\\', "/")
    }

    /// Initial run input for an uploaded file
    pub fn to_run_input(&self) -> Value {
        let mut input = Map::new();
        input.insert(
            keys::INPUT_FILE.to_string(),
            Value::String(self.normalized_path()),
        );
        input.insert(keys::MESSAGES.to_string(), Value::Array(Vec::new()));
        Value::Object(input)
    }
}

/// Non-empty `risk_data` rows of a values object
pub fn risk_rows(values: &Value) -> &[Value] {
    values
        .get(keys::RISK_DATA)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
