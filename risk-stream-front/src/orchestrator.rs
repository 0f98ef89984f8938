//! Resume protocol for interrupted workflows.
//!
//! A resume cancels whatever run is active on the thread, creates a new run
//! from the paused checkpoint with the edited risk rows, joins its stream in
//! a background task and returns as soon as the new run's id is known.

use crate::client::{RunEventStream, SharedGraphClient};
use crate::connector::{ConnectionTable, EventCallback};
use crate::error::{Result, StreamError};
use crate::events::bus::{now_millis, BusEvent, EventBus};
use crate::events::extract::{extract_run_id, extract_run_id_from_creation};
use crate::events::types::{is_terminal_event, StreamEvent, StreamEventKind};
use crate::registry::SharedRunRegistry;
use crate::types::checkpoint::WorkflowCheckpoint;
use crate::types::ids::{AssistantId, RunId, ThreadId};
use crate::types::message::messages_from_value;
use crate::types::run::{default_stream_modes, Command, CreateRunRequest};
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RUN_ID_WAIT: Duration = Duration::from_secs(10);

/// `source` of the `stream-sync` notification sent by a resume
pub const RESUME_SYNC_SOURCE: &str = "resume_workflow";

#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub thread_id: ThreadId,
    pub assistant_id: AssistantId,
    pub checkpoint: WorkflowCheckpoint,
    pub edited_rows: Vec<Value>,
    /// Node to jump to instead of the checkpoint's own node
    pub target_node: Option<String>,
}

/// `goto` of the resume command: an explicit override wins, then the node
/// the checkpoint paused at.
pub fn resolve_target_node(
    target_node: Option<&str>,
    checkpoint: &WorkflowCheckpoint,
) -> Option<String> {
    target_node
        .filter(|n| !n.is_empty())
        .or(checkpoint.node_id.as_deref().filter(|n| !n.is_empty()))
        .map(str::to_string)
}

#[derive(Debug)]
pub struct ResumeHandle {
    pub run_id: RunId,
    pub cleanup: CleanupHandle,
}

struct CleanupInner {
    thread_id: ThreadId,
    registry: SharedRunRegistry,
    bus: EventBus,
    connections: ConnectionTable,
    run_id: watch::Sender<Option<RunId>>,
    token: CancellationToken,
    done: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Tears down everything a resume set up. Cloneable and idempotent.
#[derive(Clone)]
pub struct CleanupHandle {
    inner: Arc<CleanupInner>,
}

impl std::fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupHandle")
            .field("thread_id", &self.inner.thread_id)
            .field("run_id", &*self.inner.run_id.borrow())
            .field("done", &self.is_done())
            .finish()
    }
}

impl CleanupHandle {
    fn new(
        thread_id: ThreadId,
        registry: SharedRunRegistry,
        bus: EventBus,
        connections: ConnectionTable,
    ) -> Self {
        let (run_id, _) = watch::channel(None);
        Self {
            inner: Arc::new(CleanupInner {
                thread_id,
                registry,
                bus,
                connections,
                run_id,
                token: CancellationToken::new(),
                done: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Latest run id learned for this resume
    pub fn run_id(&self) -> Option<RunId> {
        self.inner.run_id.borrow().clone()
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.inner.thread_id
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    fn note_run_id(&self, run_id: RunId) {
        self.inner.run_id.send_replace(Some(run_id));
    }

    fn watch_run_id(&self) -> watch::Receiver<Option<RunId>> {
        self.inner.run_id.subscribe()
    }

    fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    fn attach(&self, task: JoinHandle<()>) {
        match self.inner.task.lock() {
            Ok(mut slot) => *slot = Some(task),
            Err(e) => tracing::warn!("drain task slot poisoned: {}", e),
        }
    }

    /// Stop draining, forget the run and close the thread's connections.
    pub fn cleanup(&self) {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            tracing::debug!("cleanup already ran for thread {}", self.inner.thread_id);
            return;
        }
        let thread_id = &self.inner.thread_id;
        self.inner.token.cancel();

        let run_id = self
            .run_id()
            .unwrap_or_else(|| self.inner.registry.get(thread_id));
        if self.inner.registry.clear_if(thread_id, &run_id) {
            tracing::debug!("cleared active run {} of thread {}", run_id, thread_id);
        }
        let closed = self.inner.connections.close_thread(thread_id);
        tracing::info!(
            "cleaned up run {} of thread {} ({} connection(s) closed)",
            run_id,
            thread_id,
            closed
        );
        self.inner
            .bus
            .publish(BusEvent::stream_cleanup(thread_id, &run_id));
    }

    /// Wait for the drain task to finish.
    pub async fn join(&self) {
        let task = match self.inner.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("drain task of thread {} failed: {}", self.inner.thread_id, e);
            }
        }
    }
}

/// Drives [`ResumeRequest`]s against the graph service.
#[derive(Clone)]
pub struct ResumeOrchestrator {
    client: SharedGraphClient,
    registry: SharedRunRegistry,
    bus: EventBus,
    connections: ConnectionTable,
    wait_timeout: Duration,
}

impl ResumeOrchestrator {
    pub fn new(
        client: SharedGraphClient,
        registry: SharedRunRegistry,
        bus: EventBus,
        connections: ConnectionTable,
    ) -> Self {
        Self {
            client,
            registry,
            bus,
            connections,
            wait_timeout: DEFAULT_RUN_ID_WAIT,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Resume a paused workflow. Returns once the new run's id is known or
    /// the bounded wait expired; the stream keeps draining in the background.
    pub async fn resume(
        &self,
        request: ResumeRequest,
        on_event: Option<EventCallback>,
    ) -> Result<ResumeHandle> {
        let ResumeRequest {
            thread_id,
            assistant_id,
            checkpoint,
            edited_rows,
            target_node,
        } = request;
        tracing::info!(
            "resuming thread {} with {} edited row(s)",
            thread_id,
            edited_rows.len()
        );

        self.cancel_active(&thread_id).await;

        let goto = resolve_target_node(target_node.as_deref(), &checkpoint);
        let create = CreateRunRequest::new(assistant_id)
            .with_checkpoint(checkpoint)
            .with_command(Command::resume_with_risk_data(edited_rows, goto));
        let created = self
            .client
            .create_run(&thread_id, &create)
            .await
            .map_err(|e| StreamError::RunCreation(e.to_string()))?;

        let cleanup = CleanupHandle::new(
            thread_id.clone(),
            self.registry.clone(),
            self.bus.clone(),
            self.connections.clone(),
        );
        let drain = Drain {
            thread_id: thread_id.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            on_event,
            cleanup: cleanup.clone(),
        };

        match extract_run_id_from_creation(&created) {
            Some(run_id) => {
                tracing::info!("created run {} on thread {}", run_id, thread_id);
                self.registry.set(&thread_id, run_id.clone());
                cleanup.note_run_id(run_id.clone());
                self.bus.publish(BusEvent::run_created(&thread_id, &run_id));
                self.bus.publish(BusEvent::stream_sync(
                    &thread_id,
                    &run_id,
                    RESUME_SYNC_SOURCE,
                ));

                match self
                    .client
                    .join_stream(&thread_id, &run_id, &default_stream_modes())
                    .await
                {
                    Ok(stream) => {
                        let task = tokio::spawn(drain.run(stream, cleanup.token()));
                        cleanup.attach(task);
                    }
                    Err(e) => {
                        tracing::warn!("could not join stream of run {}: {}", run_id, e);
                        drain.process(stream_error_event(&e));
                        cleanup.cleanup();
                    }
                }
            }
            None => {
                tracing::warn!(
                    "run creation on thread {} returned no run id: {}",
                    thread_id,
                    created
                );
            }
        }

        let run_id = self.await_run_id(&thread_id, &cleanup).await;
        Ok(ResumeHandle { run_id, cleanup })
    }

    /// Best-effort cancel of the thread's active run; never fails the resume.
    async fn cancel_active(&self, thread_id: &ThreadId) {
        let Some(active) = self.registry.active(thread_id) else {
            return;
        };
        tracing::debug!("cancelling active run {} before resume", active);
        if let Err(e) = self.client.cancel_run(thread_id, &active, true).await {
            tracing::warn!("error cancelling run {}: {}", active, e);
        }
        self.registry.clear_if(thread_id, &active);
    }

    async fn await_run_id(&self, thread_id: &ThreadId, cleanup: &CleanupHandle) -> RunId {
        let mut rx = cleanup.watch_run_id();
        let discovered = match tokio::time::timeout(self.wait_timeout, rx.wait_for(Option::is_some))
            .await
        {
            Ok(Ok(found)) => found.clone(),
            Ok(Err(_)) | Err(_) => None,
        };
        if let Some(run_id) = discovered {
            return run_id;
        }

        if let Some(active) = self.registry.active(thread_id) {
            tracing::info!("using active run {} after run id wait", active);
            cleanup.note_run_id(active.clone());
            return active;
        }

        let fallback = RunId::fallback();
        tracing::warn!(
            "no run id for thread {} after {:?}, using {}",
            thread_id,
            self.wait_timeout,
            fallback
        );
        self.registry.set(thread_id, fallback.clone());
        cleanup.note_run_id(fallback.clone());
        fallback
    }
}

fn stream_error_event(e: &StreamError) -> StreamEvent {
    StreamEvent::new(
        StreamEventKind::Error,
        serde_json::json!({ "error": e.error_code(), "message": e.to_string() }),
    )
}

/// Background consumer of a joined run stream.
struct Drain {
    thread_id: ThreadId,
    registry: SharedRunRegistry,
    bus: EventBus,
    on_event: Option<EventCallback>,
    cleanup: CleanupHandle,
}

impl Drain {
    async fn run(self, mut stream: RunEventStream, token: CancellationToken) {
        let mut count = 0usize;
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("drain of thread {} cancelled after {} event(s)", self.thread_id, count);
                    return;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    count += 1;
                    let terminal = is_terminal_event(&event);
                    self.process(event);
                    if terminal {
                        tracing::info!("run on thread {} reached a terminal event", self.thread_id);
                        self.cleanup.cleanup();
                        return;
                    }
                }
                // a transport error is the last item of the stream
                Some(Err(e)) => {
                    tracing::warn!("stream of thread {} failed: {}", self.thread_id, e);
                    self.process(stream_error_event(&e));
                    self.cleanup.cleanup();
                    return;
                }
                None => {
                    tracing::debug!("stream of thread {} ended after {} event(s)", self.thread_id, count);
                    self.cleanup.cleanup();
                    return;
                }
            }
        }
    }

    fn process(&self, event: StreamEvent) {
        let discovered = extract_run_id(&event.data)
            .filter(|id| self.cleanup.run_id().as_ref() != Some(id));
        if let Some(run_id) = discovered {
            tracing::debug!("run id {} seen on thread {}", run_id, self.thread_id);
            self.registry.set(&self.thread_id, run_id.clone());
            self.cleanup.note_run_id(run_id.clone());
            self.bus.publish(BusEvent::run_created(&self.thread_id, &run_id));
        }
        let run_id = self
            .cleanup
            .run_id()
            .unwrap_or_else(|| self.registry.get(&self.thread_id));

        self.bus.publish(BusEvent::StreamEvent {
            thread_id: self.thread_id.clone(),
            run_id: run_id.clone(),
            event: event.clone(),
            timestamp: now_millis(),
        });
        if let Some(messages) = event.messages() {
            self.bus.publish(BusEvent::StreamMessagesUpdated {
                thread_id: self.thread_id.clone(),
                run_id: run_id.clone(),
                messages: messages_from_value(messages),
                timestamp: now_millis(),
            });
        }
        if let Some(ui_elements) = event.ui_elements() {
            self.bus.publish(BusEvent::UiElementsUpdated {
                thread_id: self.thread_id.clone(),
                run_id,
                ui_elements: ui_elements.clone(),
                timestamp: now_millis(),
            });
        }
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }
}
