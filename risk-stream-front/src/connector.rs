//! Run event stream connector.
//!
//! Opens the server-push feed of a run and republishes its events. There is
//! at most one open connection per `(thread, run)` pair. The caller owns the
//! lifecycle: transport errors are reported, never acted on, and the only
//! self-close happens on `workflow-complete`.

use crate::client::http::{endpoint_url, parse_frame};
use crate::client::sse::{SseItem, SseSource};
use crate::error::Result;
use crate::events::bus::{now_millis, BusEvent, EventBus};
use crate::events::types::{StreamEvent, StreamEventKind};
use crate::registry::SharedRunRegistry;
use crate::types::ids::{RunId, ThreadId};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub type EventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug)]
struct ConnectionEntry {
    id: u64,
    thread_id: ThreadId,
    token: CancellationToken,
}

/// Open connections keyed by `thread:run`. Shared between the connector and
/// the orchestrator's cleanup.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    entries: Arc<DashMap<String, ConnectionEntry>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(thread_id: &ThreadId, run_id: &RunId) -> String {
        format!("{}:{}", thread_id, run_id)
    }

    /// Register a connection under `key`, closing whatever held it before.
    fn register(&self, key: &str, thread_id: &ThreadId, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries.insert(
            key.to_string(),
            ConnectionEntry {
                id,
                thread_id: thread_id.clone(),
                token,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        id
    }

    /// Close and forget the connection under `key`.
    pub fn close(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Close the connection under `key` only if it is still connection `id`.
    fn close_if(&self, key: &str, id: u64) -> bool {
        match self.entries.remove_if(key, |_, entry| entry.id == id) {
            Some((_, entry)) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Force-close every connection of a thread. Returns how many were open.
    pub fn close_thread(&self, thread_id: &ThreadId) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| &e.value().thread_id == thread_id)
            .map(|e| e.key().clone())
            .collect();
        keys.iter().filter(|k| self.close(k)).count()
    }

    pub fn is_open(&self, thread_id: &ThreadId, run_id: &RunId) -> bool {
        self.entries.contains_key(&Self::key(thread_id, run_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Closes one connection. Idempotent; a no-op disposer closes nothing.
#[derive(Debug, Clone)]
pub struct StreamDisposer {
    target: Option<DisposerTarget>,
}

#[derive(Debug, Clone)]
struct DisposerTarget {
    key: String,
    id: u64,
    table: ConnectionTable,
    token: CancellationToken,
}

impl StreamDisposer {
    pub fn noop() -> Self {
        Self { target: None }
    }

    pub fn is_noop(&self) -> bool {
        self.target.is_none()
    }

    /// The connection is still open
    pub fn is_active(&self) -> bool {
        self.target
            .as_ref()
            .is_some_and(|t| !t.token.is_cancelled())
    }

    pub fn dispose(&self) {
        match &self.target {
            Some(target) => {
                target.token.cancel();
                // Only our own entry: a newer connection may hold the key now.
                target.table.close_if(&target.key, target.id);
            }
            None => tracing::debug!("dispose called on skipped stream connection"),
        }
    }
}

/// Connector for `{base}/threads/{thread}/runs/{run}/stream`.
#[derive(Clone)]
pub struct EventStreamConnector {
    base: Url,
    sse: Arc<dyn SseSource>,
    registry: SharedRunRegistry,
    bus: EventBus,
    connections: ConnectionTable,
}

impl EventStreamConnector {
    pub fn new(
        base_url: &str,
        sse: Arc<dyn SseSource>,
        registry: SharedRunRegistry,
        bus: EventBus,
        connections: ConnectionTable,
    ) -> Result<Self> {
        Ok(Self {
            base: Url::parse(base_url.trim_end_matches('/'))?,
            sse,
            registry,
            bus,
            connections,
        })
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Run id to connect to. A run id equal to the thread id means "whatever
    /// is active", which may still be the thread id.
    pub fn effective_run_id(&self, thread_id: &ThreadId, run_id: &RunId) -> RunId {
        if run_id.is_thread(thread_id) {
            self.registry.get(thread_id)
        } else {
            run_id.clone()
        }
    }

    /// Open the run's event feed. Must be called within a tokio runtime.
    pub fn connect(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        on_event: EventCallback,
        on_error: Option<ErrorCallback>,
    ) -> StreamDisposer {
        let effective = self.effective_run_id(thread_id, run_id);
        let key = ConnectionTable::key(thread_id, &effective);

        if self.connections.close(&key) {
            tracing::debug!("closed existing stream connection {}", key);
        }

        // A placeholder context would otherwise loop create -> fail -> retry.
        if effective.is_thread(thread_id) && !self.registry.contains(thread_id) {
            tracing::warn!(
                "not connecting stream for thread {}: no active run registered",
                thread_id
            );
            return StreamDisposer::noop();
        }

        let url = match endpoint_url(
            &self.base,
            &[
                "threads",
                thread_id.as_str(),
                "runs",
                effective.as_str(),
                "stream",
            ],
        ) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("cannot build stream URL for {}: {}", key, e);
                if let Some(on_error) = &on_error {
                    on_error(e.to_string());
                }
                return StreamDisposer::noop();
            }
        };

        let token = CancellationToken::new();
        let id = self
            .connections
            .register(&key, thread_id, token.clone());
        tracing::info!("connecting to run stream {}", url);
        let stream = self.sse.open(url.as_str());

        let worker = ConnectionWorker {
            key: key.clone(),
            id,
            thread_id: thread_id.clone(),
            run_id: effective,
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            connections: self.connections.clone(),
            on_event,
            on_error,
        };
        tokio::spawn(worker.run(stream, token.clone()));

        StreamDisposer {
            target: Some(DisposerTarget {
                key,
                id,
                table: self.connections.clone(),
                token,
            }),
        }
    }
}

struct ConnectionWorker {
    key: String,
    id: u64,
    thread_id: ThreadId,
    run_id: RunId,
    registry: SharedRunRegistry,
    bus: EventBus,
    connections: ConnectionTable,
    on_event: EventCallback,
    on_error: Option<ErrorCallback>,
}

impl ConnectionWorker {
    async fn run(
        self,
        mut stream: futures::stream::BoxStream<'static, SseItem>,
        token: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(SseItem::Open) => tracing::debug!("stream {} opened", self.key),
                Some(SseItem::Error(e)) => {
                    tracing::warn!("stream {} transport error: {}", self.key, e);
                    if let Some(on_error) = &self.on_error {
                        on_error(e);
                    }
                }
                Some(SseItem::Frame(frame)) => {
                    let event = parse_frame(&frame.event, &frame.data);
                    let complete = event.kind == StreamEventKind::WorkflowComplete;
                    self.deliver(event);
                    if complete {
                        tracing::info!("workflow complete on {}, closing stream", self.key);
                        self.connections.close_if(&self.key, self.id);
                        self.registry.clear_if(&self.thread_id, &self.run_id);
                        break;
                    }
                }
                None => {
                    tracing::debug!("stream {} ended by transport", self.key);
                    break;
                }
            }
        }
        self.connections.close_if(&self.key, self.id);
    }

    fn deliver(&self, event: StreamEvent) {
        match event.kind {
            StreamEventKind::WorkflowProgress => {
                self.bus.publish(BusEvent::WorkflowProgress {
                    thread_id: self.thread_id.clone(),
                    run_id: self.run_id.clone(),
                    data: event.data.clone(),
                });
            }
            StreamEventKind::WorkflowComplete => {
                self.bus.publish(BusEvent::WorkflowComplete {
                    thread_id: self.thread_id.clone(),
                    run_id: self.run_id.clone(),
                    data: event.data.clone(),
                });
            }
            StreamEventKind::Error => {
                tracing::warn!("stream {} error event: {}", self.key, event.data);
            }
            _ => {}
        }
        self.bus.publish(BusEvent::StreamEvent {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            event: event.clone(),
            timestamp: now_millis(),
        });
        (self.on_event)(event);
    }
}
