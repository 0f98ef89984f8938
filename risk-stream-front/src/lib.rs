//! Risk Stream Front - run and stream synchronization for the risk analysis
//! workflow client.
//!
//! Keeps a local view of a remote, checkpointed graph run consistent while
//! events arrive from several sources: the primary run stream, streams
//! joined after a resume, and in-process notifications.
//!
//! # Modules
//!
//! - `registry`: active run per thread
//! - `reconcile`: id-keyed message merge
//! - `events`: stream events, run id extraction, notification bus
//! - `client`: graph service client and SSE transport
//! - `connector`: run event stream connector (caller-controlled lifecycle)
//! - `logs`: supplementary log stream connector (auto-reconnecting)
//! - `orchestrator`: resume protocol for interrupted workflows
//! - `wizard`: step-wizard state machine and its persistence
//! - `session`: per-thread facade composing the above
//!
//! # Environment Variables
//!
//! - `RISK_STREAM_API_URL`: graph service base URL (session is inert without it)
//! - `RISK_STREAM_ASSISTANT_ID`: workflow graph to run (session is inert without it)
//! - `RISK_STREAM_API_KEY`: sent as `X-Api-Key`
//! - `RISK_STREAM_LOGS_URL`: log server base URL (default: http://localhost:3000)
//! - `RISK_STREAM_RUN_ID_WAIT_TIMEOUT_MS`: resume run id wait (default: 10000)
//! - `RISK_STREAM_LOG_RECONNECT_DELAY_MS`: log stream reconnect delay (default: 5000)
//! - `RISK_STREAM_STEP_STATE_DIR`: persisted wizard state (in-memory when unset)
//! - `LOG_LEVEL`, `LOG_USE_JSON`, `LOG_WITH_LOCATION`: tracing output

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod logging;
pub mod logs;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod types;
pub mod wizard;

pub use client::{
    GraphClient, HttpGraphClient, ReqwestSseSource, RunEventStream, SharedGraphClient, SseFrame,
    SseItem, SseRetry, SseSource,
};
pub use config::ClientConfig;
pub use connector::{ConnectionTable, ErrorCallback, EventCallback, EventStreamConnector, StreamDisposer};
pub use error::{Result, StreamError};
pub use events::{
    extract_run_id, extract_run_id_from_creation, is_terminal_event, BusEvent, EventBus,
    StreamEvent, StreamEventKind,
};
pub use logs::{LogCallback, LogEntry, LogEntryType, LogFilter, LogStreamConnector, LogStreamHandle};
pub use orchestrator::{
    resolve_target_node, CleanupHandle, ResumeHandle, ResumeOrchestrator, ResumeRequest,
};
pub use reconcile::{reconcile, truncate_at};
pub use registry::{InMemoryRunRegistry, RunRegistry, SharedRunRegistry};
pub use session::{MessageMetadata, SessionDeps, SessionSnapshot, StreamSession, SubmitOptions};
pub use types::{
    AssistantId, Command, CreateRunRequest, HistoryEntry, Message, MessageId, MessageType, Run,
    RunId, RunStatus, StateUpdate, StateValue, StreamMode, ThreadId, ThreadState, UploadResponse,
    WorkflowCheckpoint,
};
pub use wizard::{
    default_rules, default_steps, derive_high_water_mark, FileStepStateStore,
    InMemoryStepStateStore, ProgressRule, StepDef, StepState, StepStateStore, StepWizard,
};
