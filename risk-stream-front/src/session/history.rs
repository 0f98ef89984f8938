//! Per-message metadata derived from thread history.

use crate::types::ids::MessageId;
use crate::types::message::messages_from_value;
use crate::types::state::{keys, HistoryEntry};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Where a message first appeared and which sibling branches exist there.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub message_id: MessageId,
    pub first_seen_checkpoint: Option<Value>,
    pub parent_checkpoint: Option<Value>,
    /// Checkpoint id of the state the message first appeared in
    pub branch: Option<String>,
    /// Checkpoint ids forked from the same parent, oldest first
    pub branch_options: Vec<String>,
}

fn checkpoint_id(checkpoint: Option<&Value>) -> Option<&str> {
    checkpoint
        .and_then(|c| c.get("checkpoint_id"))
        .and_then(Value::as_str)
}

/// Build metadata for every message in a most-recent-first history.
pub fn message_metadata(history: &[HistoryEntry]) -> HashMap<MessageId, MessageMetadata> {
    let mut siblings: HashMap<&str, Vec<String>> = HashMap::new();
    for entry in history.iter().rev() {
        if let (Some(parent), Some(id)) = (
            checkpoint_id(entry.parent_checkpoint.as_ref()),
            entry.checkpoint_id(),
        ) {
            siblings.entry(parent).or_default().push(id.to_string());
        }
    }

    let mut out = HashMap::new();
    for entry in history.iter().rev() {
        let Some(messages) = entry.value(keys::MESSAGES) else {
            continue;
        };
        let parent_id = checkpoint_id(entry.parent_checkpoint.as_ref());
        for message in messages_from_value(messages) {
            let Some(id) = message.id else { continue };
            out.entry(id.clone()).or_insert_with(|| MessageMetadata {
                message_id: id,
                first_seen_checkpoint: entry.checkpoint.clone(),
                parent_checkpoint: entry.parent_checkpoint.clone(),
                branch: entry.checkpoint_id().map(str::to_string),
                branch_options: parent_id
                    .and_then(|p| siblings.get(p))
                    .cloned()
                    .unwrap_or_default(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(checkpoint: &str, parent: Option<&str>, messages: Value) -> HistoryEntry {
        serde_json::from_value(json!({
            "values": {"messages": messages},
            "checkpoint": {"checkpoint_id": checkpoint},
            "parent_checkpoint": parent.map(|p| json!({"checkpoint_id": p})),
        }))
        .unwrap()
    }

    #[test]
    fn test_first_seen_and_branches() {
        // most recent first; c2 and c2b are forks of c1
        let history = vec![
            entry(
                "c2b",
                Some("c1"),
                json!([{"id": "h1", "type": "human"}, {"id": "a2", "type": "ai"}]),
            ),
            entry(
                "c2",
                Some("c1"),
                json!([{"id": "h1", "type": "human"}, {"id": "a1", "type": "ai"}]),
            ),
            entry("c1", Some("c0"), json!([{"id": "h1", "type": "human"}])),
        ];
        let meta = message_metadata(&history);

        let h1 = &meta[&MessageId::new("h1")];
        assert_eq!(h1.branch.as_deref(), Some("c1"));
        assert_eq!(h1.parent_checkpoint, Some(json!({"checkpoint_id": "c0"})));

        let a1 = &meta[&MessageId::new("a1")];
        assert_eq!(a1.branch.as_deref(), Some("c2"));
        assert_eq!(a1.branch_options, vec!["c2".to_string(), "c2b".to_string()]);
        assert_eq!(meta[&MessageId::new("a2")].branch.as_deref(), Some("c2b"));
    }
}
