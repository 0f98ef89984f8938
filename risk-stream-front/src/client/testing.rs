//! In-memory `GraphClient` for unit tests.

use super::{GraphClient, RunEventStream};
use crate::error::{Result, StreamError};
use crate::events::types::StreamEvent;
use crate::types::ids::{RunId, ThreadId};
use crate::types::run::{CreateRunRequest, StreamMode};
use crate::types::state::{HistoryEntry, StateUpdate, ThreadState};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Scripted stream returned by `join_stream` / `stream_run`.
pub struct Script {
    pub items: Vec<Result<StreamEvent>>,
    /// Keep the stream pending after the last item
    pub hold_open: bool,
}

impl Script {
    pub fn ending(items: Vec<Result<StreamEvent>>) -> Self {
        Self {
            items,
            hold_open: false,
        }
    }

    pub fn held(items: Vec<Result<StreamEvent>>) -> Self {
        Self {
            items,
            hold_open: true,
        }
    }

    fn into_stream(self) -> RunEventStream {
        let head = futures::stream::iter(self.items);
        if self.hold_open {
            head.chain(futures::stream::pending()).boxed()
        } else {
            head.boxed()
        }
    }
}

#[derive(Default)]
pub struct FakeGraphClient {
    pub info_fails: AtomicBool,
    pub cancel_fails: AtomicBool,
    pub join_fails: AtomicBool,
    create_error: Mutex<Option<String>>,
    create_response: Mutex<Value>,
    scripts: Mutex<VecDeque<Script>>,
    pub created: Mutex<Vec<(ThreadId, CreateRunRequest)>>,
    pub streamed: Mutex<Vec<(ThreadId, CreateRunRequest)>>,
    pub joined: Mutex<Vec<(ThreadId, RunId)>>,
    pub cancelled: Mutex<Vec<(ThreadId, RunId)>>,
    pub state: Mutex<ThreadState>,
    pub history: Mutex<Vec<HistoryEntry>>,
    pub updates: Mutex<Vec<StateUpdate>>,
}

impl FakeGraphClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_to_create(&self, response: Value) {
        *self.create_response.lock().unwrap() = response;
    }

    pub fn fail_create(&self, message: &str) {
        *self.create_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    fn next_stream(&self) -> RunEventStream {
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::ending(Vec::new()))
            .into_stream()
    }
}

#[async_trait]
impl GraphClient for FakeGraphClient {
    async fn info(&self) -> Result<Value> {
        if self.info_fails.load(Ordering::SeqCst) {
            Err(StreamError::ServiceUnreachable("connection refused".into()))
        } else {
            Ok(serde_json::json!({"version": "test"}))
        }
    }

    async fn create_thread(&self, thread_id: Option<&ThreadId>) -> Result<ThreadId> {
        Ok(thread_id.cloned().unwrap_or_else(ThreadId::random))
    }

    async fn create_run(&self, thread_id: &ThreadId, request: &CreateRunRequest) -> Result<Value> {
        self.created
            .lock()
            .unwrap()
            .push((thread_id.clone(), request.clone()));
        if let Some(message) = self.create_error.lock().unwrap().clone() {
            return Err(StreamError::Status {
                status: 500,
                body: message,
            });
        }
        Ok(self.create_response.lock().unwrap().clone())
    }

    async fn stream_run(
        &self,
        thread_id: &ThreadId,
        request: &CreateRunRequest,
    ) -> Result<RunEventStream> {
        self.streamed
            .lock()
            .unwrap()
            .push((thread_id.clone(), request.clone()));
        Ok(self.next_stream())
    }

    async fn join_stream(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        _stream_mode: &[StreamMode],
    ) -> Result<RunEventStream> {
        self.joined
            .lock()
            .unwrap()
            .push((thread_id.clone(), run_id.clone()));
        if self.join_fails.load(Ordering::SeqCst) {
            return Err(StreamError::ServiceUnreachable("connection refused".into()));
        }
        Ok(self.next_stream())
    }

    async fn cancel_run(&self, thread_id: &ThreadId, run_id: &RunId, _wait: bool) -> Result<()> {
        self.cancelled
            .lock()
            .unwrap()
            .push((thread_id.clone(), run_id.clone()));
        if self.cancel_fails.load(Ordering::SeqCst) {
            return Err(StreamError::Cancel {
                run_id: run_id.to_string(),
                message: "run not found".into(),
            });
        }
        Ok(())
    }

    async fn get_state(&self, _thread_id: &ThreadId) -> Result<ThreadState> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn update_state(&self, _thread_id: &ThreadId, update: &StateUpdate) -> Result<Value> {
        self.updates.lock().unwrap().push(update.clone());
        Ok(serde_json::json!({"checkpoint": {"checkpoint_id": "cp-ui"}}))
    }

    async fn get_history(
        &self,
        _thread_id: &ThreadId,
        limit: Option<usize>,
        _before: Option<&str>,
    ) -> Result<Vec<HistoryEntry>> {
        let history = self.history.lock().unwrap().clone();
        Ok(match limit {
            Some(limit) => history.into_iter().take(limit).collect(),
            None => history,
        })
    }
}
