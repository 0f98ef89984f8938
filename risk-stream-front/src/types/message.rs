//! Conversation message types.

use crate::types::ids::MessageId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message sender type, as carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Human,
    Ai,
    Tool,
    System,
    Remove,
    #[serde(other)]
    Unknown,
}

/// A message as delivered by the graph service.
///
/// The id is optional on the wire. Fields this type does not model
/// (`tool_calls`, `name`, `additional_kwargs`, ...) are kept in `extra`
/// and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    #[serde(rename = "type", default)]
    pub kind: MessageType,

    #[serde(default)]
    pub content: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(kind: MessageType, content: impl Into<Value>) -> Self {
        Self {
            id: Some(MessageId::random()),
            kind,
            content: content.into(),
            extra: Map::new(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(MessageType::Human, Value::String(content.into()))
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::new(MessageType::Ai, Value::String(content.into()))
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Plain text of the content (string content, or concatenated text parts)
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(o) => o.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

/// Parse a `messages` array leniently: entries that fail to decode are skipped.
pub fn messages_from_value(value: &Value) -> Vec<Message> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match serde_json::from_value::<Message>(v.clone()) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::debug!("skipping undecodable message: {}", e);
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
