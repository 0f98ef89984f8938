//! Data model shared by the client components.

pub mod checkpoint;
pub mod ids;
pub mod message;
pub mod run;
pub mod state;

pub use checkpoint::{CheckpointRef, WorkflowCheckpoint};
pub use ids::{AssistantId, MessageId, RunId, ThreadId};
pub use message::{messages_from_value, Message, MessageType};
pub use run::{default_stream_modes, Command, CreateRunRequest, Run, RunStatus, StreamMode};
pub use state::{
    extract_thread_and_run_from_history, risk_rows, HistoryEntry, StateUpdate, StateValue,
    ThreadState, UploadResponse,
};
