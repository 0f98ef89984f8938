//! Graph execution service client.

pub mod http;
pub mod sse;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::Result;
use crate::events::types::StreamEvent;
use crate::types::ids::{RunId, ThreadId};
use crate::types::run::{CreateRunRequest, StreamMode};
use crate::types::state::{HistoryEntry, StateUpdate, ThreadState};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;

pub use http::HttpGraphClient;
pub use sse::{ReqwestSseSource, SseFrame, SseItem, SseRetry, SseSource};

/// Events of a run stream. An `Err` item is a mid-stream transport failure
/// and is the last item of the stream.
pub type RunEventStream = BoxStream<'static, Result<StreamEvent>>;

/// Consumed contract of the graph execution service.
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Liveness probe (`GET /info`). Any non-success answer is an error.
    async fn info(&self) -> Result<Value>;

    async fn create_thread(&self, thread_id: Option<&ThreadId>) -> Result<ThreadId>;

    /// Create a background run. The response is returned raw because the
    /// run id can appear in several shapes.
    async fn create_run(&self, thread_id: &ThreadId, request: &CreateRunRequest) -> Result<Value>;

    /// Create a run and stream its events in one request.
    async fn stream_run(
        &self,
        thread_id: &ThreadId,
        request: &CreateRunRequest,
    ) -> Result<RunEventStream>;

    /// Join the live event feed of an existing run.
    async fn join_stream(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        stream_mode: &[StreamMode],
    ) -> Result<RunEventStream>;

    /// Best-effort cancellation.
    async fn cancel_run(&self, thread_id: &ThreadId, run_id: &RunId, wait: bool) -> Result<()>;

    async fn get_state(&self, thread_id: &ThreadId) -> Result<ThreadState>;

    async fn update_state(&self, thread_id: &ThreadId, update: &StateUpdate) -> Result<Value>;

    /// Most-recent-first list of historical states.
    async fn get_history(
        &self,
        thread_id: &ThreadId,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<HistoryEntry>>;
}

pub type SharedGraphClient = Arc<dyn GraphClient>;
