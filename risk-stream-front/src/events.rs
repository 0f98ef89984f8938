//! Stream events, run id extraction and the notification bus.

pub mod bus;
pub mod extract;
pub mod types;

pub use bus::{now_millis, BusEvent, EventBus};
pub use extract::{
    extract_run_id, extract_run_id_from_creation, extract_thread_id, extract_with,
    RunIdExtractor, CREATION_RUN_ID_EXTRACTORS, EVENT_RUN_ID_EXTRACTORS,
};
pub use types::{is_terminal_event, StreamEvent, StreamEventKind};
