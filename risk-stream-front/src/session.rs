//! Per-thread stream session.
//!
//! Owns the primary run stream of one thread and folds everything else that
//! reports on the thread (resumed runs, joined streams) into a single
//! snapshot of messages, values, loading and error state. A session built
//! without an API URL or assistant id is inert: every operation is a no-op
//! and the snapshot stays empty.

pub mod history;

use crate::client::{HttpGraphClient, RunEventStream, SharedGraphClient};
use crate::config::ClientConfig;
use crate::connector::ConnectionTable;
use crate::error::{Result, StreamError};
use crate::events::bus::{BusEvent, EventBus};
use crate::events::extract::extract_run_id;
use crate::events::types::{StreamEvent, StreamEventKind};
use crate::orchestrator::{CleanupHandle, ResumeOrchestrator, ResumeRequest, DEFAULT_RUN_ID_WAIT};
use crate::reconcile::{reconcile, truncate_at};
use crate::registry::{InMemoryRunRegistry, SharedRunRegistry};
use crate::types::checkpoint::WorkflowCheckpoint;
use crate::types::ids::{AssistantId, MessageId, RunId, ThreadId};
use crate::types::message::{messages_from_value, Message};
use crate::types::run::{default_stream_modes, Command, CreateRunRequest, Run, RunStatus, StreamMode};
use crate::types::state::{keys, StateUpdate, StateValue};
use crate::wizard::{
    FileStepStateStore, InMemoryStepStateStore, SharedStepStateStore, StepState, StepWizard,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use history::{message_metadata, MessageMetadata};

const INTERRUPT_KEY: &str = "__interrupt__";

/// Options of [`StreamSession::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Fork from this checkpoint instead of the thread head
    pub checkpoint: Option<WorkflowCheckpoint>,
    pub command: Option<Command>,
    /// Defaults to `values` + `messages`
    pub stream_mode: Vec<StreamMode>,
    pub config: Option<Value>,
}

/// Observable state of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub thread_id: Option<ThreadId>,
    pub run: Option<Run>,
    pub messages: Arc<Vec<Message>>,
    pub values: Value,
    pub is_loading: bool,
    pub error: Option<String>,
    pub interrupt: Option<Value>,
    pub step: Option<StepState>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            thread_id: None,
            run: None,
            messages: Arc::new(Vec::new()),
            values: Value::Object(Map::new()),
            is_loading: false,
            error: None,
            interrupt: None,
            step: None,
        }
    }
}

/// Shared collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: SharedRunRegistry,
    pub bus: EventBus,
    pub connections: ConnectionTable,
    pub step_store: SharedStepStateStore,
    /// Reported in `service-unreachable` notices
    pub api_url: String,
    pub run_id_wait: Duration,
}

impl Default for SessionDeps {
    fn default() -> Self {
        Self {
            registry: InMemoryRunRegistry::shared(),
            bus: EventBus::default(),
            connections: ConnectionTable::new(),
            step_store: InMemoryStepStateStore::shared(),
            api_url: String::new(),
            run_id_wait: DEFAULT_RUN_ID_WAIT,
        }
    }
}

impl SessionDeps {
    pub fn from_config(config: &ClientConfig) -> Self {
        let step_store: SharedStepStateStore = match &config.step_state_dir {
            Some(dir) => Arc::new(FileStepStateStore::new(dir.clone())),
            None => InMemoryStepStateStore::shared(),
        };
        Self {
            bus: EventBus::new(config.event_bus_capacity),
            step_store,
            api_url: config.api_base().unwrap_or_default().to_string(),
            run_id_wait: config.run_id_wait_timeout(),
            ..Default::default()
        }
    }
}

struct Backend {
    client: SharedGraphClient,
    assistant_id: AssistantId,
    orchestrator: ResumeOrchestrator,
}

struct SessionInner {
    backend: Option<Backend>,
    deps: SessionDeps,
    state: watch::Sender<SessionSnapshot>,
    wizard: tokio::sync::Mutex<Option<StepWizard>>,
    primary: Mutex<Option<CancellationToken>>,
    resume_cleanup: Mutex<Option<CleanupHandle>>,
    metadata: DashMap<MessageId, MessageMetadata>,
    branch: Mutex<Option<String>>,
    last_shown_error: Mutex<Option<String>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Session facade for one thread. Cloning shares the session.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StreamSession {
    /// Session over an explicit client. Without a client or an assistant id
    /// the session is inert.
    pub fn new(
        client: Option<SharedGraphClient>,
        assistant_id: Option<AssistantId>,
        thread_id: Option<ThreadId>,
        deps: SessionDeps,
    ) -> Self {
        let backend = match (client, assistant_id) {
            (Some(client), Some(assistant_id)) => Some(Backend {
                orchestrator: ResumeOrchestrator::new(
                    client.clone(),
                    deps.registry.clone(),
                    deps.bus.clone(),
                    deps.connections.clone(),
                )
                .with_wait_timeout(deps.run_id_wait),
                client,
                assistant_id,
            }),
            _ => {
                tracing::warn!("stream session missing api_url or assistant_id, staying inert");
                None
            }
        };
        let (state, _) = watch::channel(SessionSnapshot {
            thread_id,
            ..Default::default()
        });
        Self {
            inner: Arc::new(SessionInner {
                backend,
                deps,
                state,
                wizard: tokio::sync::Mutex::new(None),
                primary: Mutex::new(None),
                resume_cleanup: Mutex::new(None),
                metadata: DashMap::new(),
                branch: Mutex::new(None),
                last_shown_error: Mutex::new(None),
                background: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &ClientConfig, thread_id: Option<ThreadId>) -> Result<Self> {
        let deps = SessionDeps::from_config(config);
        if !config.is_configured() {
            return Ok(Self::new(None, None, thread_id, deps));
        }
        let client: SharedGraphClient = Arc::new(HttpGraphClient::from_config(config)?);
        let assistant = config.assistant().map(AssistantId::from);
        Ok(Self::new(Some(client), assistant, thread_id, deps))
    }

    pub fn is_configured(&self) -> bool {
        self.inner.backend.is_some()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.deps.bus
    }

    pub fn registry(&self) -> &SharedRunRegistry {
        &self.inner.deps.registry
    }

    /// Restore the wizard, start the bus listener and run the health check
    /// once. Must be called within a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        let Some(backend) = &self.inner.backend else {
            return Ok(());
        };
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(thread_id) = self.thread_id() {
            self.inner.load_wizard(&thread_id).await?;
        }

        let weak = Arc::downgrade(&self.inner);
        let bus_stream = self.inner.deps.bus.stream();
        let listener = tokio::spawn(async move {
            let mut bus_stream = Box::pin(bus_stream);
            while let Some(event) = bus_stream.next().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_bus_event(event).await;
            }
        });

        let client = backend.client.clone();
        let bus = self.inner.deps.bus.clone();
        let api_url = self.inner.deps.api_url.clone();
        let health = tokio::spawn(async move {
            match client.info().await {
                Ok(_) => tracing::debug!("graph service at {} is reachable", api_url),
                Err(e) => {
                    tracing::warn!("graph service at {} unreachable: {}", api_url, e);
                    bus.publish(BusEvent::ServiceUnreachable {
                        api_url,
                        message: e.to_string(),
                    });
                }
            }
        });
        lock(&self.inner.background).extend([listener, health]);
        Ok(())
    }

    /// Stop background tasks and the primary stream.
    pub fn shutdown(&self) {
        if let Some(token) = lock(&self.inner.primary).take() {
            token.cancel();
        }
        for task in lock(&self.inner.background).drain(..) {
            task.abort();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.inner.state.borrow().thread_id.clone()
    }

    pub fn run(&self) -> Option<Run> {
        self.inner.state.borrow().run.clone()
    }

    pub fn messages(&self) -> Arc<Vec<Message>> {
        self.inner.state.borrow().messages.clone()
    }

    pub fn values(&self) -> Value {
        self.inner.state.borrow().values.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.borrow().error.clone()
    }

    /// Pending interrupt of the paused node
    pub fn interrupt(&self) -> Option<Value> {
        self.inner.state.borrow().interrupt.clone()
    }

    /// Current error if it differs from the last one shown; publishes an
    /// `error-notice` for it.
    pub fn take_unseen_error(&self) -> Option<String> {
        let error = self.error()?;
        let mut last = lock(&self.inner.last_shown_error);
        if last.as_deref() == Some(error.as_str()) {
            return None;
        }
        *last = Some(error.clone());
        drop(last);
        if let Some(thread_id) = self.thread_id() {
            self.inner.deps.bus.publish(BusEvent::ErrorNotice {
                thread_id,
                message: error.clone(),
            });
        }
        Some(error)
    }

    pub fn get_messages_metadata(&self, message: &Message) -> Option<MessageMetadata> {
        let id = message.id.as_ref()?;
        self.inner.metadata.get(id).map(|m| m.value().clone())
    }

    /// Checkpoint id the next plain submit forks from
    pub fn set_branch(&self, branch: impl Into<String>) {
        let branch = branch.into();
        tracing::debug!("branch set to {}", branch);
        *lock(&self.inner.branch) = Some(branch);
    }

    pub fn branch(&self) -> Option<String> {
        lock(&self.inner.branch).clone()
    }

    pub async fn step_state(&self) -> Option<StepState> {
        self.inner.wizard.lock().await.as_ref().map(StepWizard::state)
    }

    pub async fn reset_token(&self) -> Option<uuid::Uuid> {
        self.inner.wizard.lock().await.as_ref().map(StepWizard::reset_token)
    }

    /// Manual wizard navigation; false when the step is not reachable.
    pub async fn request_step(&self, idx: usize) -> Result<bool> {
        let changed = match self.inner.wizard.lock().await.as_mut() {
            Some(wizard) => wizard.request_step(idx).await?,
            None => false,
        };
        self.inner.publish_step().await;
        Ok(changed)
    }

    /// Start a run on the current thread (creating the thread when needed)
    /// and stream it in the background.
    pub async fn submit(&self, input: Option<Value>, options: SubmitOptions) -> Result<()> {
        let Some(backend) = &self.inner.backend else {
            tracing::debug!("submit ignored: session not configured");
            return Ok(());
        };
        let thread_id = match self.thread_id() {
            Some(thread_id) => thread_id,
            None => {
                let thread_id = backend.client.create_thread(None).await?;
                tracing::info!("created thread {}", thread_id);
                self.inner
                    .state
                    .send_modify(|s| s.thread_id = Some(thread_id.clone()));
                self.inner.load_wizard(&thread_id).await?;
                thread_id
            }
        };

        if let Some(input) = &input {
            let optimistic = input
                .get(keys::MESSAGES)
                .map(messages_from_value)
                .unwrap_or_default();
            self.inner.merge_messages(&optimistic);
        }

        let checkpoint = options.checkpoint.or_else(|| {
            lock(&self.inner.branch).take().map(|branch| {
                let mut checkpoint = WorkflowCheckpoint::default();
                checkpoint
                    .extra
                    .insert("checkpoint_id".to_string(), Value::String(branch));
                checkpoint
            })
        });
        let stream_mode = if options.stream_mode.is_empty() {
            default_stream_modes()
        } else {
            options.stream_mode
        };
        let mut request =
            CreateRunRequest::new(backend.assistant_id.clone()).with_stream_mode(stream_mode);
        if let Some(input) = input {
            request = request.with_input(input);
        }
        if let Some(checkpoint) = checkpoint {
            request = request.with_checkpoint(checkpoint);
        }
        if let Some(command) = options.command {
            request = request.with_command(command);
        }
        request.config = options.config;

        self.release_active_run(backend, &thread_id).await;
        let stream = match backend.client.stream_run(&thread_id, &request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.set_error(e.to_string());
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        *lock(&self.inner.primary) = Some(token.clone());
        self.inner.state.send_modify(|s| {
            s.error = None;
            s.run = None;
        });
        self.inner.set_loading(true).await;

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(run_primary(weak, thread_id, stream, token));
        Ok(())
    }

    /// Let go of whatever run is active on the thread: the primary stream,
    /// a resumed run's drain, and the server-side run itself.
    async fn release_active_run(&self, backend: &Backend, thread_id: &ThreadId) {
        if let Some(token) = lock(&self.inner.primary).take() {
            token.cancel();
        }
        let cleanup = lock(&self.inner.resume_cleanup).take();
        let active = self
            .inner
            .deps
            .registry
            .active(thread_id)
            .or_else(|| cleanup.as_ref().and_then(CleanupHandle::run_id));
        if let Some(cleanup) = cleanup {
            cleanup.cleanup();
        }
        let Some(active) = active else {
            return;
        };
        tracing::debug!("releasing run {} of thread {}", active, thread_id);
        if let Err(e) = backend.client.cancel_run(thread_id, &active, true).await {
            tracing::warn!("error cancelling run {}: {}", active, e);
        }
        self.inner.deps.registry.clear_if(thread_id, &active);
    }

    /// Best-effort cancel of the active run.
    pub async fn stop(&self) {
        let Some(backend) = &self.inner.backend else {
            return;
        };
        if let Some(token) = lock(&self.inner.primary).take() {
            token.cancel();
        }
        let cleanup = lock(&self.inner.resume_cleanup).take();
        if let Some(cleanup) = cleanup {
            cleanup.cleanup();
        }
        let Some(thread_id) = self.thread_id() else {
            return;
        };
        let run_id = self
            .run()
            .map(|r| r.run_id)
            .or_else(|| self.inner.deps.registry.active(&thread_id));
        if let Some(run_id) = run_id {
            if let Err(e) = backend.client.cancel_run(&thread_id, &run_id, false).await {
                tracing::warn!("error cancelling run {}: {}", run_id, e);
            }
            self.inner.deps.registry.clear_if(&thread_id, &run_id);
        }
        self.inner.state.send_modify(|s| {
            if let Some(run) = s.run.as_mut() {
                run.transition(RunStatus::Cancelled);
            }
        });
        self.inner.set_loading(false).await;
    }

    /// Resume the paused workflow of the current thread with edited rows.
    pub async fn resume(
        &self,
        checkpoint: WorkflowCheckpoint,
        edited_rows: Vec<Value>,
        target_node: Option<String>,
    ) -> Result<Option<RunId>> {
        let Some(backend) = &self.inner.backend else {
            tracing::debug!("resume ignored: session not configured");
            return Ok(None);
        };
        let thread_id = self
            .thread_id()
            .ok_or_else(|| StreamError::InvalidInput("no thread to resume".to_string()))?;
        if let Some(token) = lock(&self.inner.primary).take() {
            token.cancel();
        }
        let previous = lock(&self.inner.resume_cleanup).take();
        if let Some(previous) = previous {
            previous.cleanup();
        }
        let handle = backend
            .orchestrator
            .resume(
                ResumeRequest {
                    thread_id: thread_id.clone(),
                    assistant_id: backend.assistant_id.clone(),
                    checkpoint,
                    edited_rows,
                    target_node,
                },
                None,
            )
            .await?;
        let run_id = handle.run_id.clone();
        self.inner.set_run(&thread_id, &run_id);
        *lock(&self.inner.resume_cleanup) = Some(handle.cleanup);
        Ok(Some(run_id))
    }

    /// Re-run from the checkpoint before `message_id`, dropping it and
    /// everything after it.
    pub async fn regenerate(&self, message_id: &MessageId) -> Result<()> {
        if !self.is_configured() {
            return Ok(());
        }
        if !self.inner.metadata.contains_key(message_id) {
            self.refresh_history().await?;
        }
        let parent = self
            .inner
            .metadata
            .get(message_id)
            .and_then(|m| m.parent_checkpoint.clone())
            .ok_or_else(|| {
                StreamError::InvalidInput(format!("no parent checkpoint for message {}", message_id))
            })?;
        let checkpoint: WorkflowCheckpoint = serde_json::from_value(parent)?;
        self.inner.state.send_if_modified(|s| {
            let truncated = truncate_at(&s.messages, message_id, true);
            let changed = !Arc::ptr_eq(&truncated, &s.messages);
            s.messages = truncated;
            changed
        });
        self.submit(
            None,
            SubmitOptions {
                checkpoint: Some(checkpoint),
                ..Default::default()
            },
        )
        .await
    }

    /// Reload message metadata from the thread history.
    pub async fn refresh_history(&self) -> Result<()> {
        let (Some(backend), Some(thread_id)) = (&self.inner.backend, self.thread_id()) else {
            return Ok(());
        };
        let history = backend.client.get_history(&thread_id, None, None).await?;
        self.inner.metadata.clear();
        for (id, meta) in message_metadata(&history) {
            self.inner.metadata.insert(id, meta);
        }
        Ok(())
    }

    /// Load the thread's current state into the snapshot.
    pub async fn refresh_state(&self) -> Result<()> {
        let (Some(backend), Some(thread_id)) = (&self.inner.backend, self.thread_id()) else {
            return Ok(());
        };
        let state = backend.client.get_state(&thread_id).await?;
        let interrupts = state.interrupts();
        self.inner.apply_values(state.values).await;
        if !interrupts.is_empty() {
            self.inner
                .state
                .send_modify(|s| s.interrupt = Some(Value::Array(interrupts)));
        }
        Ok(())
    }

    /// Write edited values back to the thread as a UI update, then reload
    /// the state.
    pub async fn update_values(&self, values: Vec<StateValue>) -> Result<()> {
        let (Some(backend), Some(thread_id)) = (&self.inner.backend, self.thread_id()) else {
            return Ok(());
        };
        let update = StateUpdate::new(&thread_id, values);
        let response = backend.client.update_state(&thread_id, &update).await?;
        tracing::debug!("state of thread {} updated: {}", thread_id, response);
        self.refresh_state().await
    }

    /// Point the session at another thread (or none).
    pub async fn switch_thread(&self, thread_id: Option<ThreadId>) -> Result<()> {
        if let Some(token) = lock(&self.inner.primary).take() {
            token.cancel();
        }
        self.inner.metadata.clear();
        *lock(&self.inner.last_shown_error) = None;
        self.inner.state.send_replace(SessionSnapshot {
            thread_id: thread_id.clone(),
            ..Default::default()
        });
        match &thread_id {
            Some(thread_id) if self.is_configured() => self.inner.load_wizard(thread_id).await?,
            _ => *self.inner.wizard.lock().await = None,
        }
        Ok(())
    }

    /// Explicit "new run": stop, forget the thread and reset the wizard.
    pub async fn new_run(&self) -> Result<()> {
        if !self.is_configured() {
            return Ok(());
        }
        self.stop().await;
        if let Some(wizard) = self.inner.wizard.lock().await.as_mut() {
            wizard.new_run().await?;
        }
        *lock(&self.inner.branch) = None;
        self.switch_thread(None).await
    }
}

async fn run_primary(
    weak: Weak<SessionInner>,
    thread_id: ThreadId,
    mut stream: RunEventStream,
    token: CancellationToken,
) {
    let mut failed = false;
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => return,
            item = stream.next() => item,
        };
        let Some(inner) = weak.upgrade() else { return };
        match item {
            Some(Ok(event)) => inner.on_primary_event(&thread_id, event).await,
            Some(Err(e)) => {
                tracing::warn!("primary stream of thread {} failed: {}", thread_id, e);
                inner.set_error(e.to_string());
                failed = true;
                break;
            }
            None => break,
        }
    }
    let Some(inner) = weak.upgrade() else { return };
    if token.is_cancelled() {
        return;
    }
    let status = if failed || inner.state.borrow().error.is_some() {
        RunStatus::Error
    } else {
        RunStatus::Completed
    };
    let run_id = inner.state.borrow().run.as_ref().map(|r| r.run_id.clone());
    if let Some(run_id) = run_id {
        inner.deps.registry.clear_if(&thread_id, &run_id);
    }
    inner.state.send_modify(|s| {
        if let Some(run) = s.run.as_mut() {
            run.transition(status);
        }
    });
    inner.set_loading(false).await;
    token.cancel();
    tracing::debug!("primary stream of thread {} finished", thread_id);
}

/// Messages carried by an event of any stream mode.
fn messages_of_event(event: &StreamEvent) -> Vec<Message> {
    let kind = event.kind.as_str();
    if kind.starts_with("messages") {
        // `messages` mode sends `[message, metadata]` tuples
        if let Some([message, meta]) = event.data.as_array().map(Vec::as_slice) {
            if meta.get("type").is_none() && message.is_object() {
                return messages_from_value(&Value::Array(vec![message.clone()]));
            }
        }
        return messages_from_value(&event.data);
    }
    event.messages().map(messages_from_value).unwrap_or_default()
}

impl SessionInner {
    fn primary_active(&self) -> bool {
        lock(&self.primary)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn current_thread(&self) -> Option<ThreadId> {
        self.state.borrow().thread_id.clone()
    }

    async fn load_wizard(&self, thread_id: &ThreadId) -> Result<()> {
        let wizard = StepWizard::with_defaults(thread_id.clone(), self.deps.step_store.clone()).await?;
        let step = wizard.state();
        *self.wizard.lock().await = Some(wizard);
        self.state.send_modify(|s| s.step = Some(step));
        Ok(())
    }

    async fn publish_step(&self) {
        let step = self.wizard.lock().await.as_ref().map(StepWizard::state);
        self.state.send_if_modified(|s| {
            let changed = s.step != step;
            s.step = step;
            changed
        });
    }

    fn merge_messages(&self, incoming: &[Message]) {
        if incoming.is_empty() {
            return;
        }
        self.state.send_if_modified(|s| {
            let merged = reconcile(&s.messages, incoming);
            let changed = !Arc::ptr_eq(&merged, &s.messages);
            s.messages = merged;
            changed
        });
    }

    fn set_error(&self, message: String) {
        tracing::warn!("session error: {}", message);
        self.state.send_modify(|s| s.error = Some(message));
    }

    fn set_run(&self, thread_id: &ThreadId, run_id: &RunId) {
        self.state.send_if_modified(|s| {
            if s.run.as_ref().is_some_and(|r| &r.run_id == run_id) {
                return false;
            }
            let mut run = Run::new(run_id.clone(), thread_id.clone());
            run.transition(RunStatus::Streaming);
            s.run = Some(run);
            true
        });
    }

    async fn set_loading(&self, loading: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.is_loading != loading;
            s.is_loading = loading;
            changed
        });
        let result = match self.wizard.lock().await.as_mut() {
            Some(wizard) => wizard.on_loading_changed(loading).await,
            None => Ok(false),
        };
        if let Err(e) = result {
            tracing::warn!("could not persist step state: {}", e);
        }
        self.publish_step().await;
    }

    /// Replace values with an authoritative values object.
    async fn apply_values(&self, values: Value) {
        if !values.is_object() {
            return;
        }
        let messages = values
            .get(keys::MESSAGES)
            .map(messages_from_value)
            .unwrap_or_default();
        let interrupt = values.get(INTERRUPT_KEY).filter(|v| !v.is_null()).cloned();
        self.merge_messages(&messages);
        self.state.send_modify(|s| {
            s.values = values.clone();
            if interrupt.is_some() {
                s.interrupt = interrupt;
            }
        });
        self.observe_values(&values).await;
    }

    /// Shallow-overwrite the `ui_elements` key.
    async fn merge_ui_elements(&self, ui_elements: Value) {
        let values = {
            let mut values = Value::Null;
            self.state.send_modify(|s| {
                if !s.values.is_object() {
                    s.values = Value::Object(Map::new());
                }
                if let Some(map) = s.values.as_object_mut() {
                    map.insert(keys::UI_ELEMENTS.to_string(), ui_elements);
                }
                values = s.values.clone();
            });
            values
        };
        self.observe_values(&values).await;
    }

    async fn observe_values(&self, values: &Value) {
        let result = match self.wizard.lock().await.as_mut() {
            Some(wizard) => wizard.on_values(values).await,
            None => Ok(false),
        };
        if let Err(e) = result {
            tracing::warn!("could not persist step state: {}", e);
        }
        self.publish_step().await;
    }

    async fn on_primary_event(&self, thread_id: &ThreadId, event: StreamEvent) {
        if let Some(run_id) = extract_run_id(&event.data) {
            let known = self
                .state
                .borrow()
                .run
                .as_ref()
                .is_some_and(|r| r.run_id == run_id);
            if !known {
                tracing::debug!("primary stream of thread {} is run {}", thread_id, run_id);
                self.deps.registry.set(thread_id, run_id.clone());
                self.set_run(thread_id, &run_id);
                self.deps.bus.publish(BusEvent::run_created(thread_id, &run_id));
            }
        }
        match &event.kind {
            StreamEventKind::Error => {
                self.set_error(event.error_message().unwrap_or_default());
            }
            kind if kind.as_str() == "values" => self.apply_values(event.data).await,
            _ => self.merge_messages(&messages_of_event(&event)),
        }
    }

    async fn on_bus_event(&self, event: BusEvent) {
        if event.thread_id().is_none() || event.thread_id() != self.current_thread().as_ref() {
            return;
        }
        match event {
            BusEvent::RunCreated { thread_id, run_id } => self.set_run(&thread_id, &run_id),
            BusEvent::StreamSync { .. } => self.set_loading(true).await,
            // the primary stream owns the loading flag while it runs
            BusEvent::StreamCleanup { .. } if self.primary_active() => {}
            BusEvent::StreamCleanup { .. } => self.set_loading(false).await,
            BusEvent::StreamMessagesUpdated { messages, .. } => self.merge_messages(&messages),
            BusEvent::UiElementsUpdated { ui_elements, .. } => {
                self.merge_ui_elements(ui_elements).await
            }
            BusEvent::StreamEvent { event, .. } => {
                if event.is_error() {
                    self.set_error(event.error_message().unwrap_or_default());
                } else if event.kind.as_str() == "values" {
                    self.apply_values(event.data).await;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{FakeGraphClient, Script};
    use serde_json::json;

    fn session(client: &Arc<FakeGraphClient>, thread: Option<&str>) -> StreamSession {
        StreamSession::new(
            Some(client.clone()),
            Some(AssistantId::new("agent")),
            thread.map(ThreadId::new),
            SessionDeps {
                api_url: "http://localhost:2024".to_string(),
                run_id_wait: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_inert_without_configuration() {
        let s = StreamSession::new(None, None, None, SessionDeps::default());
        assert!(!s.is_configured());
        s.start().await.unwrap();
        s.submit(Some(json!({"messages": []})), SubmitOptions::default())
            .await
            .unwrap();
        s.stop().await;
        assert_eq!(s.resume(WorkflowCheckpoint::default(), vec![], None).await.unwrap(), None);
        assert!(s.messages().is_empty());
        assert_eq!(s.values(), json!({}));
        assert!(!s.is_loading());
    }

    #[tokio::test]
    async fn test_from_config_inert() {
        let s = StreamSession::from_config(&ClientConfig::default(), None).unwrap();
        assert!(!s.is_configured());
    }

    #[tokio::test]
    async fn test_submit_streams_values_and_messages() {
        let client = Arc::new(FakeGraphClient::new());
        client.push_script(Script::ending(vec![
            Ok(StreamEvent::new("metadata", json!({"run_id": "R1"}))),
            Ok(StreamEvent::new(
                "messages",
                json!([{"id": "a1", "type": "ai", "content": "Ana"}, {"langgraph_node": "agent"}]),
            )),
            Ok(StreamEvent::new(
                "values",
                json!({"input_file": "a.pdf", "messages": [
                    {"id": "h1", "type": "human", "content": "hi"},
                    {"id": "a1", "type": "ai", "content": "Analysis"}
                ]}),
            )),
        ]));
        let s = session(&client, None);
        let mut rx = s.bus().subscribe();

        s.submit(
            Some(json!({"messages": [{"id": "h1", "type": "human", "content": "hi"}]})),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
        settle().await;

        let thread = s.thread_id().unwrap();
        let ids: Vec<String> = s
            .messages()
            .iter()
            .filter_map(|m| m.id.as_ref().map(|id| id.to_string()))
            .collect();
        assert_eq!(ids, vec!["h1", "a1"]);
        assert_eq!(s.messages()[1].text(), "Analysis");
        assert_eq!(s.values()["input_file"], "a.pdf");
        assert!(!s.is_loading());
        assert_eq!(s.run().unwrap().status, RunStatus::Completed);
        assert!(!s.registry().contains(&thread));
        assert_eq!(s.step_state().await.unwrap().completed_steps_high_water_mark, 1);
        assert_eq!(rx.try_recv().unwrap().name(), "run-created");

        let streamed = client.streamed.lock().unwrap().clone();
        let body = serde_json::to_value(&streamed[0].1).unwrap();
        assert_eq!(body["stream_mode"], json!(["values", "messages"]));
    }

    #[tokio::test]
    async fn test_bus_updates_are_merged() {
        let client = Arc::new(FakeGraphClient::new());
        let s = session(&client, Some("T1"));
        s.start().await.unwrap();
        let thread = ThreadId::new("T1");
        let run = RunId::new("R1");

        s.bus().publish(BusEvent::StreamMessagesUpdated {
            thread_id: thread.clone(),
            run_id: run.clone(),
            messages: vec![Message::ai("x").with_id("m1")],
            timestamp: 1,
        });
        s.bus().publish(BusEvent::StreamMessagesUpdated {
            thread_id: thread.clone(),
            run_id: run.clone(),
            messages: vec![
                Message::ai("y").with_id("m1"),
                Message {
                    id: None,
                    ..Message::ai("anon")
                },
            ],
            timestamp: 2,
        });
        s.bus().publish(BusEvent::UiElementsUpdated {
            thread_id: thread.clone(),
            run_id: run.clone(),
            ui_elements: json!([{"id": "u1", "component": "RiskMatrix"}]),
            timestamp: 3,
        });
        // another thread's traffic is ignored
        s.bus().publish(BusEvent::StreamMessagesUpdated {
            thread_id: ThreadId::new("T2"),
            run_id: run.clone(),
            messages: vec![Message::ai("z").with_id("m2")],
            timestamp: 4,
        });
        settle().await;

        let messages = s.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "y");
        assert_eq!(s.values()["ui_elements"][0]["component"], "RiskMatrix");
        s.shutdown();
    }

    #[tokio::test]
    async fn test_health_check_reports_unreachable() {
        let client = Arc::new(FakeGraphClient::new());
        client.info_fails.store(true, Ordering::SeqCst);
        let s = session(&client, None);
        let mut rx = s.bus().subscribe();
        s.start().await.unwrap();
        s.start().await.unwrap();
        settle().await;

        match rx.try_recv().unwrap() {
            BusEvent::ServiceUnreachable { api_url, .. } => {
                assert_eq!(api_url, "http://localhost:2024")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        s.shutdown();
    }

    #[tokio::test]
    async fn test_error_shown_once() {
        let client = Arc::new(FakeGraphClient::new());
        client.push_script(Script::ending(vec![Ok(StreamEvent::error("graph failed"))]));
        let s = session(&client, Some("T1"));
        s.submit(None, SubmitOptions::default()).await.unwrap();
        settle().await;

        assert_eq!(s.error().as_deref(), Some("graph failed"));
        assert_eq!(s.take_unseen_error().as_deref(), Some("graph failed"));
        assert_eq!(s.take_unseen_error(), None);
        assert_eq!(s.run(), None);
    }

    #[tokio::test]
    async fn test_stop_cancels_active_run() {
        let client = Arc::new(FakeGraphClient::new());
        client.push_script(Script::held(vec![Ok(StreamEvent::new(
            "metadata",
            json!({"run_id": "R1"}),
        ))]));
        let s = session(&client, Some("T1"));
        s.submit(None, SubmitOptions::default()).await.unwrap();
        settle().await;
        assert!(s.is_loading());

        s.stop().await;
        assert!(!s.is_loading());
        assert_eq!(s.run().unwrap().status, RunStatus::Cancelled);
        assert_eq!(
            client.cancelled.lock().unwrap().clone(),
            vec![(ThreadId::new("T1"), RunId::new("R1"))]
        );
        assert!(!s.registry().contains(&ThreadId::new("T1")));
    }

    #[tokio::test]
    async fn test_resume_feeds_session_through_bus() {
        let client = Arc::new(FakeGraphClient::new());
        client.respond_to_create(json!({"run_id": "R5"}));
        client.push_script(Script::ending(vec![Ok(StreamEvent::new(
            "values",
            json!({"risk_data": [{"Id": "R1", "Nível de Risco": "Alto"}],
                   "messages": [{"id": "a9", "type": "ai", "content": "done"}]}),
        ))]));
        let s = session(&client, Some("T1"));
        s.start().await.unwrap();

        let run_id = s
            .resume(
                WorkflowCheckpoint::new("analyze_hazards", json!({})),
                vec![json!({"Id": "R1", "Nível de Risco": "Alto"})],
                None,
            )
            .await
            .unwrap();
        assert_eq!(run_id, Some(RunId::new("R5")));
        settle().await;

        assert_eq!(s.messages().len(), 1);
        assert_eq!(s.values()["risk_data"][0]["Id"], "R1");
        assert!(!s.is_loading());
        // stream-sync then stream-cleanup: loading -> idle with risk data
        let step = s.step_state().await.unwrap();
        assert_eq!(step.current_step_index, 8);
        s.shutdown();
    }

    #[tokio::test]
    async fn test_submit_releases_resumed_run() {
        let client = Arc::new(FakeGraphClient::new());
        client.respond_to_create(json!({"run_id": "R-old"}));
        client.push_script(Script::held(Vec::new()));
        client.push_script(Script::held(vec![Ok(StreamEvent::new(
            "metadata",
            json!({"run_id": "R-new"}),
        ))]));
        let s = session(&client, Some("T1"));
        s.start().await.unwrap();
        let thread = ThreadId::new("T1");

        s.resume(WorkflowCheckpoint::new("analyze_hazards", json!({})), vec![], None)
            .await
            .unwrap();
        assert_eq!(s.registry().active(&thread), Some(RunId::new("R-old")));

        s.submit(None, SubmitOptions::default()).await.unwrap();
        settle().await;

        assert_eq!(
            client.cancelled.lock().unwrap().clone(),
            vec![(thread.clone(), RunId::new("R-old"))]
        );
        assert!(lock(&s.inner.resume_cleanup).is_none());
        assert_eq!(s.registry().active(&thread), Some(RunId::new("R-new")));
        assert_eq!(s.run().unwrap().run_id, RunId::new("R-new"));
        // the resumed run's late cleanup does not end the new run's loading
        assert!(s.is_loading());
        s.shutdown();
    }

    #[tokio::test]
    async fn test_resumed_stream_failure_ends_loading() {
        let client = Arc::new(FakeGraphClient::new());
        client.respond_to_create(json!({"run_id": "R1"}));
        client.push_script(Script::ending(vec![Err(StreamError::Stream(
            "connection reset".into(),
        ))]));
        let s = session(&client, Some("T1"));
        s.start().await.unwrap();

        s.resume(WorkflowCheckpoint::new("analyze_hazards", json!({})), vec![], None)
            .await
            .unwrap();
        settle().await;

        assert!(s.error().unwrap().contains("connection reset"));
        assert!(!s.is_loading());
        assert_eq!(s.registry().active(&ThreadId::new("T1")), None);
        s.shutdown();
    }

    #[tokio::test]
    async fn test_regenerate_truncates_and_forks() {
        let client = Arc::new(FakeGraphClient::new());
        *client.history.lock().unwrap() = vec![
            serde_json::from_value(json!({
                "values": {"messages": [
                    {"id": "h1", "type": "human", "content": "hi"},
                    {"id": "a1", "type": "ai", "content": "old"}
                ]},
                "checkpoint": {"checkpoint_id": "c2"},
                "parent_checkpoint": {"checkpoint_id": "c1"}
            }))
            .unwrap(),
        ];
        let s = session(&client, Some("T1"));
        s.inner.merge_messages(&[
            Message::human("hi").with_id("h1"),
            Message::ai("old").with_id("a1"),
        ]);

        s.regenerate(&MessageId::new("a1")).await.unwrap();
        let ids: Vec<String> = s
            .messages()
            .iter()
            .filter_map(|m| m.id.as_ref().map(|id| id.to_string()))
            .collect();
        assert_eq!(ids, vec!["h1"]);

        let meta = s
            .get_messages_metadata(&Message::ai("old").with_id("a1"))
            .unwrap();
        assert_eq!(meta.branch.as_deref(), Some("c2"));

        let streamed = client.streamed.lock().unwrap().clone();
        let body = serde_json::to_value(&streamed[0].1).unwrap();
        assert_eq!(body["checkpoint"]["checkpoint_id"], "c1");
        assert!(body.get("input").is_none());
    }

    #[tokio::test]
    async fn test_set_branch_applies_to_next_submit() {
        let client = Arc::new(FakeGraphClient::new());
        let s = session(&client, Some("T1"));
        s.set_branch("c7");
        s.submit(None, SubmitOptions::default()).await.unwrap();
        s.submit(None, SubmitOptions::default()).await.unwrap();

        let streamed = client.streamed.lock().unwrap().clone();
        let first = serde_json::to_value(&streamed[0].1).unwrap();
        let second = serde_json::to_value(&streamed[1].1).unwrap();
        assert_eq!(first["checkpoint"]["checkpoint_id"], "c7");
        assert!(second.get("checkpoint").is_none());
    }

    #[tokio::test]
    async fn test_new_run_resets_everything() {
        let client = Arc::new(FakeGraphClient::new());
        let s = session(&client, Some("T1"));
        s.start().await.unwrap();
        s.inner
            .apply_values(json!({"risk_data": [{"Id": "R1"}], "messages": [
                {"id": "m1", "type": "ai", "content": "x"}
            ]}))
            .await;
        assert_eq!(s.step_state().await.unwrap().completed_steps_high_water_mark, 3);
        let token = s.reset_token().await.unwrap();

        s.new_run().await.unwrap();
        assert_eq!(s.thread_id(), None);
        assert!(s.messages().is_empty());
        assert_eq!(s.step_state().await, None);
        assert_eq!(
            s.inner
                .deps
                .step_store
                .load(&ThreadId::new("T1"))
                .await
                .unwrap(),
            None
        );
        s.switch_thread(Some(ThreadId::new("T1"))).await.unwrap();
        assert_eq!(s.step_state().await, Some(StepState::default()));
        assert_ne!(s.reset_token().await, Some(token));
        s.shutdown();
    }

    #[tokio::test]
    async fn test_refresh_state_reads_interrupts() {
        let client = Arc::new(FakeGraphClient::new());
        *client.state.lock().unwrap() = serde_json::from_value(json!({
            "values": {"risk_data": [{"Id": "R1", "Causas": ["x"]}]},
            "next": ["review"],
            "tasks": [{"interrupts": [{"value": {"node_id": "review"}}]}]
        }))
        .unwrap();
        let s = session(&client, Some("T1"));
        s.start().await.unwrap();
        s.refresh_state().await.unwrap();

        assert_eq!(s.values()["risk_data"][0]["Id"], "R1");
        assert_eq!(s.interrupt().unwrap()[0]["value"]["node_id"], "review");
        assert_eq!(s.step_state().await.unwrap().completed_steps_high_water_mark, 4);
        s.shutdown();
    }

    #[tokio::test]
    async fn test_update_values_writes_ui_update() {
        let client = Arc::new(FakeGraphClient::new());
        *client.state.lock().unwrap() = serde_json::from_value(json!({
            "values": {"risk_data": [{"Id": "R1", "Causas": ["edited"]}]}
        }))
        .unwrap();
        let s = session(&client, Some("T1"));
        s.update_values(vec![StateValue::new(
            keys::RISK_DATA,
            json!([{"Id": "R1", "Causas": ["edited"]}]),
        )])
        .await
        .unwrap();

        let updates = client.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].as_node, StateUpdate::DEFAULT_AS_NODE);
        assert_eq!(updates[0].values[0].key, "risk_data");
        assert_eq!(s.values()["risk_data"][0]["Causas"][0], "edited");
    }

    #[test]
    fn test_messages_of_event_shapes() {
        let tuple = StreamEvent::new(
            "messages",
            json!([{"id": "a1", "type": "ai", "content": "x"}, {"langgraph_node": "n"}]),
        );
        assert_eq!(messages_of_event(&tuple).len(), 1);

        let partial = StreamEvent::new(
            "messages/partial",
            json!([{"id": "a1", "type": "ai", "content": "x"}, {"id": "a2", "type": "ai"}]),
        );
        assert_eq!(messages_of_event(&partial).len(), 2);

        let other = StreamEvent::new("updates", json!({"messages": [{"id": "a3", "type": "ai"}]}));
        assert_eq!(messages_of_event(&other).len(), 1);
    }
}
