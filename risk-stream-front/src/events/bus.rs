//! In-process notification bus.
//!
//! Typed replacement for page-wide custom events. Every variant serializes
//! as `{"type": <name>, "detail": {...}}` with the camelCase field names the
//! UI panels already consume.

use crate::events::types::StreamEvent;
use crate::types::ids::{RunId, ThreadId};
use crate::types::message::Message;
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "detail",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum BusEvent {
    RunCreated {
        thread_id: ThreadId,
        run_id: RunId,
    },
    StreamSync {
        thread_id: ThreadId,
        run_id: RunId,
        timestamp: i64,
        source: String,
    },
    StreamEvent {
        thread_id: ThreadId,
        run_id: RunId,
        event: StreamEvent,
        timestamp: i64,
    },
    StreamMessagesUpdated {
        thread_id: ThreadId,
        run_id: RunId,
        messages: Vec<Message>,
        timestamp: i64,
    },
    UiElementsUpdated {
        thread_id: ThreadId,
        run_id: RunId,
        ui_elements: Value,
        timestamp: i64,
    },
    StreamCleanup {
        thread_id: ThreadId,
        run_id: RunId,
        timestamp: i64,
    },
    WorkflowProgress {
        thread_id: ThreadId,
        run_id: RunId,
        data: Value,
    },
    WorkflowComplete {
        thread_id: ThreadId,
        run_id: RunId,
        data: Value,
    },
    /// Health check failed; shown once as a dismissible notice
    ServiceUnreachable { api_url: String, message: String },
    /// Terminal workflow error, already deduplicated
    ErrorNotice { thread_id: ThreadId, message: String },
}

impl BusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::RunCreated { .. } => "run-created",
            BusEvent::StreamSync { .. } => "stream-sync",
            BusEvent::StreamEvent { .. } => "stream-event",
            BusEvent::StreamMessagesUpdated { .. } => "stream-messages-updated",
            BusEvent::UiElementsUpdated { .. } => "ui-elements-updated",
            BusEvent::StreamCleanup { .. } => "stream-cleanup",
            BusEvent::WorkflowProgress { .. } => "workflow-progress",
            BusEvent::WorkflowComplete { .. } => "workflow-complete",
            BusEvent::ServiceUnreachable { .. } => "service-unreachable",
            BusEvent::ErrorNotice { .. } => "error-notice",
        }
    }

    pub fn thread_id(&self) -> Option<&ThreadId> {
        match self {
            BusEvent::RunCreated { thread_id, .. }
            | BusEvent::StreamSync { thread_id, .. }
            | BusEvent::StreamEvent { thread_id, .. }
            | BusEvent::StreamMessagesUpdated { thread_id, .. }
            | BusEvent::UiElementsUpdated { thread_id, .. }
            | BusEvent::StreamCleanup { thread_id, .. }
            | BusEvent::WorkflowProgress { thread_id, .. }
            | BusEvent::WorkflowComplete { thread_id, .. }
            | BusEvent::ErrorNotice { thread_id, .. } => Some(thread_id),
            BusEvent::ServiceUnreachable { .. } => None,
        }
    }

    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            BusEvent::RunCreated { run_id, .. }
            | BusEvent::StreamSync { run_id, .. }
            | BusEvent::StreamEvent { run_id, .. }
            | BusEvent::StreamMessagesUpdated { run_id, .. }
            | BusEvent::UiElementsUpdated { run_id, .. }
            | BusEvent::StreamCleanup { run_id, .. }
            | BusEvent::WorkflowProgress { run_id, .. }
            | BusEvent::WorkflowComplete { run_id, .. } => Some(run_id),
            BusEvent::ServiceUnreachable { .. } | BusEvent::ErrorNotice { .. } => None,
        }
    }

    pub fn run_created(thread_id: &ThreadId, run_id: &RunId) -> Self {
        BusEvent::RunCreated {
            thread_id: thread_id.clone(),
            run_id: run_id.clone(),
        }
    }

    pub fn stream_sync(thread_id: &ThreadId, run_id: &RunId, source: &str) -> Self {
        BusEvent::StreamSync {
            thread_id: thread_id.clone(),
            run_id: run_id.clone(),
            timestamp: now_millis(),
            source: source.to_string(),
        }
    }

    pub fn stream_cleanup(thread_id: &ThreadId, run_id: &RunId) -> Self {
        BusEvent::StreamCleanup {
            thread_id: thread_id.clone(),
            run_id: run_id.clone(),
            timestamp: now_millis(),
        }
    }
}

/// Broadcast publish/subscribe channel.
///
/// Cloning yields another handle to the same channel. Slow subscribers lose
/// the oldest events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: BusEvent) -> usize {
        tracing::trace!("bus publish: {}", event.name());
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Subscription as a stream; lag is logged and skipped.
    pub fn stream(&self) -> impl Stream<Item = BusEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!("bus subscriber lagged, {} event(s) skipped", n);
                    None
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
