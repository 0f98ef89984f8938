//! Server-sent events transport.

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest_eventsource::retry::{ExponentialBackoff, Never};
use reqwest_eventsource::{Event, EventSource};
use std::time::Duration;

pub const API_KEY_HEADER: &str = "X-Api-Key";

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One raw frame: event name (`message` when unnamed) and data text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    /// Connection (re)established
    Open,
    Frame(SseFrame),
    /// Connection-level failure; the stream may continue after a retry
    Error(String),
}

/// Reconnect behavior of the underlying event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseRetry {
    /// End the stream on the first transport error
    Never,
    /// Reconnect with exponential backoff
    Backoff { initial: Duration, max: Duration },
}

impl Default for SseRetry {
    fn default() -> Self {
        SseRetry::Backoff {
            initial: BASE_BACKOFF,
            max: MAX_BACKOFF,
        }
    }
}

/// Opens server-push connections. Dropping the returned stream closes
/// the connection.
pub trait SseSource: Send + Sync {
    fn open(&self, url: &str) -> BoxStream<'static, SseItem>;
}

/// `SseSource` backed by `reqwest-eventsource`.
#[derive(Debug, Clone)]
pub struct ReqwestSseSource {
    client: reqwest::Client,
    api_key: Option<String>,
    retry: SseRetry,
}

impl ReqwestSseSource {
    pub fn new(client: reqwest::Client, api_key: Option<String>, retry: SseRetry) -> Self {
        Self {
            client,
            api_key,
            retry,
        }
    }
}

impl SseSource for ReqwestSseSource {
    fn open(&self, url: &str) -> BoxStream<'static, SseItem> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        event_source_items(request, self.retry)
    }
}

/// Drive an event source built from `request` as a stream of `SseItem`s.
pub(crate) fn event_source_items(
    request: reqwest::RequestBuilder,
    retry: SseRetry,
) -> BoxStream<'static, SseItem> {
    async_stream::stream! {
        let mut es = match EventSource::new(request) {
            Ok(es) => es,
            Err(e) => {
                yield SseItem::Error(format!("cannot open event source: {}", e));
                return;
            }
        };
        match retry {
            SseRetry::Never => es.set_retry_policy(Box::new(Never)),
            SseRetry::Backoff { initial, max } => es.set_retry_policy(Box::new(
                ExponentialBackoff::new(initial, 2.0, Some(max), None),
            )),
        }
        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => yield SseItem::Open,
                Ok(Event::Message(msg)) => {
                    yield SseItem::Frame(SseFrame { event: msg.event, data: msg.data });
                }
                Err(reqwest_eventsource::Error::StreamEnded) if retry == SseRetry::Never => {
                    break;
                }
                Err(e) => {
                    yield SseItem::Error(e.to_string());
                    if retry == SseRetry::Never {
                        break;
                    }
                }
            }
        }
        es.close();
    }
    .boxed()
}
