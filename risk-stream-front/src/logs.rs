//! Supplementary log stream.
//!
//! Unlike the run connector, this connector is resilient by itself: any
//! transport error or stream end closes the connection and a new one is
//! opened after a fixed delay, until the handle is stopped.

use crate::client::http::endpoint_url;
use crate::client::sse::{SseItem, SseSource};
use crate::error::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

const SERVER_SOURCE: &str = "fastApi";
const SYSTEM_SOURCE: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEntryType {
    #[default]
    Log,
    System,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(rename = "type", default)]
    pub kind: LogEntryType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_modules: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogEntry {
    pub fn system(message: impl Into<String>, level: Option<&str>, source: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Some(now.timestamp_millis()),
            kind: LogEntryType::System,
            level: level.map(str::to_string),
            message: message.into(),
            timestamp: now.to_rfc3339(),
            source: Some(source.to_string()),
            ..Default::default()
        }
    }
}

/// What a raw frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum LogFrame {
    Entry(LogEntry),
    Metadata(Vec<String>),
}

/// Parse one frame's data. Unparseable data becomes a system error entry.
pub fn parse_log_frame(data: &str) -> LogFrame {
    let parsed = serde_json::from_str::<Value>(data)
        .and_then(serde_json::from_value::<LogEntry>);
    match parsed {
        Ok(entry) if entry.kind == LogEntryType::Metadata => {
            LogFrame::Metadata(entry.available_modules.unwrap_or_default())
        }
        Ok(entry) => LogFrame::Entry(LogEntry {
            id: Some(chrono::Utc::now().timestamp_millis()),
            source: Some(SERVER_SOURCE.to_string()),
            ..entry
        }),
        Err(e) => {
            tracing::debug!("unparseable log frame: {}", e);
            LogFrame::Entry(LogEntry::system(
                format!("Error parsing log: {}", data),
                Some("ERROR"),
                SYSTEM_SOURCE,
            ))
        }
    }
}

/// Viewer filter. `None` means "all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub level: Option<String>,
    pub module: Option<String>,
    pub search: String,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if entry.kind == LogEntryType::Metadata {
            return false;
        }
        if let Some(level) = &self.level {
            // level only constrains real log lines
            if entry.kind == LogEntryType::Log
                && !entry
                    .level
                    .as_deref()
                    .is_some_and(|l| l.eq_ignore_ascii_case(level))
            {
                return false;
            }
        }
        if let (Some(module), Some(entry_module)) = (&self.module, &entry.module) {
            if module != entry_module {
                return false;
            }
        }
        if !self.search.is_empty()
            && !entry
                .message
                .to_lowercase()
                .contains(&self.search.to_lowercase())
        {
            return false;
        }
        true
    }

    pub fn apply<'a>(&self, entries: &'a [LogEntry]) -> Vec<&'a LogEntry> {
        entries.iter().filter(|e| self.matches(e)).collect()
    }
}

pub type LogCallback = Arc<dyn Fn(LogEntry) + Send + Sync>;

/// Auto-reconnecting connector for `{logs}/logs`.
#[derive(Clone)]
pub struct LogStreamConnector {
    base: Url,
    sse: Arc<dyn SseSource>,
    http: reqwest::Client,
    reconnect_delay: Duration,
}

impl LogStreamConnector {
    pub fn new(
        logs_url: &str,
        sse: Arc<dyn SseSource>,
        http: reqwest::Client,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base: Url::parse(logs_url.trim_end_matches('/'))?,
            sse,
            http,
            reconnect_delay,
        })
    }

    /// `GET {logs}/health` answered with a success status
    pub async fn health(&self) -> Result<bool> {
        let url = endpoint_url(&self.base, &["health"])?;
        match self.http.get(url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                tracing::debug!("log server health check failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Start streaming. Must be called within a tokio runtime.
    pub fn start(&self, on_entry: LogCallback) -> Result<LogStreamHandle> {
        let url = endpoint_url(&self.base, &["logs"])?;
        let token = CancellationToken::new();
        let modules = Arc::new(RwLock::new(BTreeSet::new()));
        let (connected_tx, connected_rx) = watch::channel(false);

        let worker = LogWorker {
            url: url.to_string(),
            sse: self.sse.clone(),
            reconnect_delay: self.reconnect_delay,
            modules: modules.clone(),
            connected: connected_tx,
            on_entry,
        };
        let task = tokio::spawn(worker.run(token.clone()));

        Ok(LogStreamHandle {
            token,
            task: Some(task),
            modules,
            connected: connected_rx,
        })
    }
}

pub struct LogStreamHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    modules: Arc<RwLock<BTreeSet<String>>>,
    connected: watch::Receiver<bool>,
}

impl LogStreamHandle {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Modules announced by metadata frames so far, sorted
    pub async fn available_modules(&self) -> Vec<String> {
        self.modules.read().await.iter().cloned().collect()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop and wait for the worker to finish
    pub async fn join(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("log stream task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for LogStreamHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct LogWorker {
    url: String,
    sse: Arc<dyn SseSource>,
    reconnect_delay: Duration,
    modules: Arc<RwLock<BTreeSet<String>>>,
    connected: watch::Sender<bool>,
    on_entry: LogCallback,
}

impl LogWorker {
    async fn run(self, token: CancellationToken) {
        loop {
            tracing::info!("connecting to log stream at {}", self.url);
            let mut stream = self.sse.open(&self.url);
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(SseItem::Open) => {
                        self.connected.send_replace(true);
                        (self.on_entry)(LogEntry::system(
                            "Connected to log stream",
                            None,
                            SERVER_SOURCE,
                        ));
                    }
                    Some(SseItem::Frame(frame)) => match parse_log_frame(&frame.data) {
                        LogFrame::Metadata(modules) => {
                            self.modules.write().await.extend(modules);
                        }
                        LogFrame::Entry(entry) => (self.on_entry)(entry),
                    },
                    Some(SseItem::Error(e)) => {
                        tracing::warn!("log stream error: {}", e);
                        break;
                    }
                    None => {
                        tracing::debug!("log stream ended");
                        break;
                    }
                }
            }
            drop(stream);
            self.connected.send_replace(false);
            (self.on_entry)(LogEntry::system(
                "Error connecting to log stream. Reconnecting...",
                None,
                SYSTEM_SOURCE,
            ));
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}
