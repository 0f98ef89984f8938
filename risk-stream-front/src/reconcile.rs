//! Id-keyed message merge.
//!
//! Messages are identified by id, never by position. The same id delivered
//! twice is the same logical message and the later delivery wins, which
//! keeps the merge idempotent under duplicated or reordered deliveries
//! from independent sources.

use crate::types::ids::MessageId;
use crate::types::message::Message;
use indexmap::IndexMap;
use std::sync::Arc;

/// Merge `incoming` into `previous`.
///
/// Existing ids keep their position and take the incoming content; new ids
/// are appended in arrival order; messages without an id are dropped. When
/// the result equals `previous` the same `Arc` is returned so callers can
/// skip propagation with `Arc::ptr_eq`.
pub fn reconcile(previous: &Arc<Vec<Message>>, incoming: &[Message]) -> Arc<Vec<Message>> {
    let mut merged: IndexMap<&MessageId, &Message> =
        IndexMap::with_capacity(previous.len() + incoming.len());

    for message in previous.iter().chain(incoming.iter()) {
        if let Some(id) = message.id.as_ref() {
            merged.insert(id, message);
        }
    }

    let dropped = incoming.iter().filter(|m| m.id.is_none()).count();
    if dropped > 0 {
        tracing::debug!("dropped {} incoming message(s) without id", dropped);
    }

    if merged.len() == previous.len()
        && merged
            .values()
            .zip(previous.iter())
            .all(|(next, prev)| messages_equal(next, prev))
    {
        return Arc::clone(previous);
    }

    Arc::new(merged.into_values().cloned().collect())
}

/// Structural equality: same id and same serialized payload.
pub fn messages_equal(a: &Message, b: &Message) -> bool {
    a.id == b.id && a.kind == b.kind && a.content == b.content && a.extra == b.extra
}

/// Drop every message after `id` (exclusive of it when `inclusive` is false).
/// Used when a response is regenerated from an earlier point.
pub fn truncate_at(
    messages: &Arc<Vec<Message>>,
    id: &MessageId,
    inclusive: bool,
) -> Arc<Vec<Message>> {
    match messages.iter().position(|m| m.id.as_ref() == Some(id)) {
        Some(pos) => {
            let end = if inclusive { pos } else { pos + 1 };
            if end == messages.len() {
                Arc::clone(messages)
            } else {
                Arc::new(messages[..end].to_vec())
            }
        }
        None => Arc::clone(messages),
    }
}
