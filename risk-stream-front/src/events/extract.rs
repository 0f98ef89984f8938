//! Best-effort run id extraction.
//!
//! Run ids show up in several payload shapes. Each shape has its own
//! extractor; a chain is tried in order and the first hit wins. A miss is
//! never an error.

use crate::types::ids::{RunId, ThreadId};
use serde_json::Value;

pub type RunIdExtractor = fn(&Value) -> Option<RunId>;

fn non_empty_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// `{ run_id }`
pub fn top_level_run_id(data: &Value) -> Option<RunId> {
    non_empty_str(data.get("run_id")).map(RunId::from)
}

/// `{ metadata: { run_id } }`
pub fn metadata_run_id(data: &Value) -> Option<RunId> {
    non_empty_str(data.get("metadata").and_then(|m| m.get("run_id"))).map(RunId::from)
}

/// `{ "run-<anything>": { metadata: { run_id } } }`
pub fn run_keyed_metadata_run_id(data: &Value) -> Option<RunId> {
    data.as_object()?
        .iter()
        .filter(|(key, _)| key.starts_with("run-"))
        .find_map(|(_, v)| metadata_run_id(v))
}

/// `{ id }` of a run creation response
pub fn creation_id(data: &Value) -> Option<RunId> {
    non_empty_str(data.get("id")).map(RunId::from)
}

/// `{ checkpoint: { metadata: { run_id } } }`
pub fn checkpoint_metadata_run_id(data: &Value) -> Option<RunId> {
    data.get("checkpoint").and_then(metadata_run_id)
}

/// Chain used for every drained stream event
pub const EVENT_RUN_ID_EXTRACTORS: &[RunIdExtractor] =
    &[top_level_run_id, metadata_run_id, run_keyed_metadata_run_id];

/// Chain used for run creation responses
pub const CREATION_RUN_ID_EXTRACTORS: &[RunIdExtractor] = &[
    creation_id,
    top_level_run_id,
    checkpoint_metadata_run_id,
    metadata_run_id,
];

pub fn extract_with(extractors: &[RunIdExtractor], data: &Value) -> Option<RunId> {
    extractors.iter().find_map(|extract| extract(data))
}

pub fn extract_run_id(data: &Value) -> Option<RunId> {
    extract_with(EVENT_RUN_ID_EXTRACTORS, data)
}

pub fn extract_run_id_from_creation(response: &Value) -> Option<RunId> {
    extract_with(CREATION_RUN_ID_EXTRACTORS, response)
}

/// `thread_id` at the top level or under `metadata`
pub fn extract_thread_id(data: &Value) -> Option<ThreadId> {
    non_empty_str(data.get("thread_id"))
        .or_else(|| non_empty_str(data.get("metadata").and_then(|m| m.get("thread_id"))))
        .map(ThreadId::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_wins() {
        let data = json!({"run_id": "A", "metadata": {"run_id": "B"}});
        assert_eq!(extract_run_id(&data), Some(RunId::new("A")));
    }

    #[test]
    fn test_metadata_shape() {
        let data = json!({"metadata": {"run_id": "B"}});
        assert_eq!(extract_run_id(&data), Some(RunId::new("B")));
    }

    #[test]
    fn test_run_keyed_shape() {
        let data = json!({
            "values": {},
            "run-1f0a": {"metadata": {"run_id": "C"}}
        });
        assert_eq!(extract_run_id(&data), Some(RunId::new("C")));
        assert!(run_keyed_metadata_run_id(&json!({"runs": {"metadata": {"run_id": "X"}}})).is_none());
    }

    #[test]
    fn test_absent_degrades_to_none() {
        assert!(extract_run_id(&json!({"values": {}})).is_none());
        assert!(extract_run_id(&json!("plain string")).is_none());
        assert!(extract_run_id(&Value::Null).is_none());
        assert!(extract_run_id(&json!({"run_id": ""})).is_none());
        assert!(extract_run_id(&json!({"run_id": 12})).is_none());
    }

    #[test]
    fn test_creation_chain() {
        assert_eq!(
            extract_run_id_from_creation(&json!({"id": "R1", "run_id": "R2"})),
            Some(RunId::new("R1"))
        );
        assert_eq!(
            extract_run_id_from_creation(&json!({"checkpoint": {"metadata": {"run_id": "R3"}}})),
            Some(RunId::new("R3"))
        );
        assert!(extract_run_id_from_creation(&json!({"status": "pending"})).is_none());
    }

    #[test]
    fn test_custom_chain_order() {
        let chain: &[RunIdExtractor] = &[metadata_run_id, top_level_run_id];
        let data = json!({"run_id": "A", "metadata": {"run_id": "B"}});
        assert_eq!(extract_with(chain, &data), Some(RunId::new("B")));
    }

    #[test]
    fn test_thread_id() {
        assert_eq!(
            extract_thread_id(&json!({"metadata": {"thread_id": "T"}})),
            Some(ThreadId::new("T"))
        );
    }
}
