//! HTTP implementation of `GraphClient`.

use super::sse::{event_source_items, SseItem, SseRetry, API_KEY_HEADER};
use super::{GraphClient, RunEventStream};
use crate::config::ClientConfig;
use crate::error::{Result, StreamError};
use crate::events::types::{StreamEvent, StreamEventKind};
use crate::types::ids::{RunId, ThreadId};
use crate::types::run::{CreateRunRequest, StreamMode};
use crate::types::state::{HistoryEntry, StateUpdate, ThreadState};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpGraphClient {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
}

impl HttpGraphClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))?;
        if base.cannot_be_a_base() {
            return Err(StreamError::InvalidInput(format!(
                "not a base URL: {}",
                base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            api_key,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let base = config
            .api_base()
            .ok_or_else(|| StreamError::NotConfigured("api_url".to_string()))?;
        Self::new(base, config.api_key.clone())
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        endpoint_url(&self.base, segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StreamError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value> {
        let response = Self::check(builder.send().await?).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Run events of an SSE response; stops at the first transport error.
    fn run_events(builder: RequestBuilder) -> RunEventStream {
        event_source_items(
            builder.header(reqwest::header::ACCEPT, "text/event-stream"),
            SseRetry::Never,
        )
        .filter_map(|item| async move {
            match item {
                SseItem::Open => None,
                SseItem::Frame(frame) => Some(Ok(parse_frame(&frame.event, &frame.data))),
                SseItem::Error(e) => Some(Err(StreamError::Stream(e))),
            }
        })
        .boxed()
    }
}

/// `base` extended by percent-encoded path segments
pub fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| StreamError::InvalidInput(format!("not a base URL: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// JSON payload of a frame; malformed payloads become error events.
pub fn parse_frame(event: &str, data: &str) -> StreamEvent {
    let kind = StreamEventKind::from(event);
    if data.trim().is_empty() {
        return StreamEvent::new(kind, Value::Null);
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => StreamEvent::new(kind, value),
        Err(e) => {
            tracing::warn!("malformed {} payload: {}", kind, e);
            StreamEvent::parse_error(&kind, data)
        }
    }
}

#[async_trait]
impl GraphClient for HttpGraphClient {
    async fn info(&self) -> Result<Value> {
        let url = self.endpoint(&["info"])?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| StreamError::ServiceUnreachable(e.to_string()))?;
        self.send_json_response(response).await
    }

    async fn create_thread(&self, thread_id: Option<&ThreadId>) -> Result<ThreadId> {
        let url = self.endpoint(&["threads"])?;
        let body = match thread_id {
            Some(id) => serde_json::json!({ "thread_id": id, "if_exists": "do_nothing" }),
            None => serde_json::json!({}),
        };
        let created = self
            .send_json(self.request(Method::POST, url).json(&body))
            .await?;
        crate::events::extract_thread_id(&created)
            .or_else(|| thread_id.cloned())
            .ok_or_else(|| StreamError::Stream("thread creation returned no thread_id".into()))
    }

    async fn create_run(&self, thread_id: &ThreadId, request: &CreateRunRequest) -> Result<Value> {
        let url = self.endpoint(&["threads", thread_id.as_str(), "runs"])?;
        tracing::debug!("creating run on thread {}", thread_id);
        self.send_json(self.request(Method::POST, url).json(request))
            .await
    }

    async fn stream_run(
        &self,
        thread_id: &ThreadId,
        request: &CreateRunRequest,
    ) -> Result<RunEventStream> {
        let url = self.endpoint(&["threads", thread_id.as_str(), "runs", "stream"])?;
        Ok(Self::run_events(
            self.request(Method::POST, url).json(request),
        ))
    }

    async fn join_stream(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        stream_mode: &[StreamMode],
    ) -> Result<RunEventStream> {
        let mut url = self.endpoint(&[
            "threads",
            thread_id.as_str(),
            "runs",
            run_id.as_str(),
            "stream",
        ])?;
        {
            let mut query = url.query_pairs_mut();
            for mode in stream_mode {
                query.append_pair("stream_mode", mode_name(*mode));
            }
            query.append_pair("cancel_on_disconnect", "true");
        }
        tracing::debug!("joining stream {}", url);
        Ok(Self::run_events(self.request(Method::GET, url)))
    }

    async fn cancel_run(&self, thread_id: &ThreadId, run_id: &RunId, wait: bool) -> Result<()> {
        let mut url = self.endpoint(&[
            "threads",
            thread_id.as_str(),
            "runs",
            run_id.as_str(),
            "cancel",
        ])?;
        url.query_pairs_mut()
            .append_pair("wait", if wait { "1" } else { "0" });
        self.send_json(self.request(Method::POST, url))
            .await
            .map(|_| ())
            .map_err(|e| StreamError::Cancel {
                run_id: run_id.to_string(),
                message: e.to_string(),
            })
    }

    async fn get_state(&self, thread_id: &ThreadId) -> Result<ThreadState> {
        let url = self.endpoint(&["threads", thread_id.as_str(), "state"])?;
        let value = self.send_json(self.request(Method::GET, url)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn update_state(&self, thread_id: &ThreadId, update: &StateUpdate) -> Result<Value> {
        let url = self.endpoint(&["threads", thread_id.as_str(), "state"])?;
        self.send_json(self.request(Method::POST, url).json(update))
            .await
    }

    async fn get_history(
        &self,
        thread_id: &ThreadId,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<HistoryEntry>> {
        let mut url = self.endpoint(&["threads", thread_id.as_str(), "history"])?;
        if limit.is_some() || before.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(before) = before {
                query.append_pair("before", before);
            }
        }
        let value = self.send_json(self.request(Method::GET, url)).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl HttpGraphClient {
    async fn send_json_response(&self, response: Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::ServiceUnreachable(format!(
                "{} answered {}",
                self.base, status
            )));
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}

fn mode_name(mode: StreamMode) -> &'static str {
    match mode {
        StreamMode::Values => "values",
        StreamMode::Messages => "messages",
        StreamMode::Updates => "updates",
        StreamMode::Events => "events",
        StreamMode::Debug => "debug",
    }
}
