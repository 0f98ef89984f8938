//! Risk stream command line driver.
//!
//! Talks to the graph service and the log server with the same components
//! the UI layer uses: watch a run's event feed, resume a paused workflow,
//! inspect thread state or history, and follow the log stream.
//!
//! # Environment Variables
//!
//! - `RISK_STREAM_API_URL`, `RISK_STREAM_ASSISTANT_ID`: graph service
//!   (also accepted as `--api-url` / `--assistant-id`)
//! - `RISK_STREAM_API_KEY`: sent as `X-Api-Key`
//! - `RISK_STREAM_LOGS_URL`: log server base URL
//! - `LOG_LEVEL`, `LOG_USE_JSON`: tracing output (written to stderr)
//!
//! See `ClientConfig` for additional configuration options.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use risk_stream_front::client::{GraphClient, HttpGraphClient, ReqwestSseSource, SseRetry};
use risk_stream_front::config::ClientConfig;
use risk_stream_front::connector::{ConnectionTable, EventCallback, EventStreamConnector};
use risk_stream_front::events::{EventBus, StreamEvent};
use risk_stream_front::logging::{load_logging_config_from_env, tracing_init};
use risk_stream_front::logs::{LogEntry, LogFilter, LogStreamConnector};
use risk_stream_front::orchestrator::{ResumeOrchestrator, ResumeRequest};
use risk_stream_front::registry::InMemoryRunRegistry;
use risk_stream_front::types::{
    extract_thread_and_run_from_history, AssistantId, RunId, ThreadId, WorkflowCheckpoint,
};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Graph service base URL (overrides RISK_STREAM_API_URL)
    #[arg(long, env = "RISK_STREAM_API_URL")]
    api_url: Option<String>,

    /// Workflow graph (overrides RISK_STREAM_ASSISTANT_ID)
    #[arg(long, env = "RISK_STREAM_ASSISTANT_ID")]
    assistant_id: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Probe the graph service
    Health,

    /// Print the event feed of a run as JSON lines
    Watch {
        #[arg(long, short)]
        thread: String,
        /// Defaults to the latest run found in the thread history
        #[arg(long, short)]
        run: Option<String>,
    },

    /// Resume a paused workflow with edited risk rows
    Resume {
        #[arg(long, short)]
        thread: String,
        /// Checkpoint: file path or json string
        #[arg(long, short)]
        checkpoint: String,
        /// Edited rows: file path or json array string
        #[arg(long, short = 'r', default_value = "[]")]
        rows: String,
        /// Node to jump to instead of the checkpoint's own node
        #[arg(long)]
        target_node: Option<String>,
    },

    /// Print the current state of a thread
    State {
        #[arg(long, short)]
        thread: String,
    },

    /// Print the checkpoint history of a thread
    History {
        #[arg(long, short)]
        thread: String,
        #[arg(long, short, default_value = "10")]
        limit: usize,
    },

    /// Follow the supplementary log stream
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        module: Option<String>,
        #[arg(long, short, default_value = "")]
        search: String,
    },
}

// filepath or json string: try to read the file first, then parse as json
fn read_json_arg(input: &str) -> anyhow::Result<Value> {
    let content = match std::fs::read_to_string(input) {
        Ok(content) => content,
        Err(_) => input.to_string(),
    };
    serde_json::from_str(&content).with_context(|| format!("not a json file or string: {input}"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn graph_client(config: &ClientConfig) -> anyhow::Result<Arc<HttpGraphClient>> {
    Ok(Arc::new(HttpGraphClient::from_config(config)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let conf = load_logging_config_from_env().unwrap_or_default();
    tracing_init(&conf);

    let mut config = ClientConfig::from_env()?;
    if args.api_url.is_some() {
        config.api_url = args.api_url;
    }
    if args.assistant_id.is_some() {
        config.assistant_id = args.assistant_id;
    }

    match args.command {
        Cmd::Health => {
            let client = graph_client(&config)?;
            let info = client.info().await?;
            print_json(&info)?;
        }
        Cmd::Watch { thread, run } => {
            let client = graph_client(&config)?;
            let thread_id = ThreadId::new(thread);
            let run_id = match run {
                Some(run) => RunId::new(run),
                None => {
                    let history = client.get_history(&thread_id, Some(1), None).await?;
                    extract_thread_and_run_from_history(&history)
                        .map(|(_, run_id)| run_id)
                        .ok_or_else(|| anyhow!("no run found in history of {}", thread_id))?
                }
            };
            let registry = InMemoryRunRegistry::shared();
            registry.set(&thread_id, run_id.clone());
            let sse = Arc::new(ReqwestSseSource::new(
                client.http().clone(),
                config.api_key.clone(),
                SseRetry::default(),
            ));
            let connector = EventStreamConnector::new(
                client.base_url().as_str(),
                sse,
                registry,
                EventBus::new(config.event_bus_capacity),
                ConnectionTable::new(),
            )?;

            let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
            let on_event: EventCallback = Arc::new(move |event: StreamEvent| {
                let _ = tx.send(event);
            });
            let disposer = connector.connect(
                &thread_id,
                &run_id,
                on_event,
                Some(Arc::new(|e: String| tracing::warn!("stream error: {}", e))),
            );
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = rx.recv() => match event {
                        Some(event) => print_json(&event)?,
                        None => break,
                    },
                }
            }
            disposer.dispose();
        }
        Cmd::Resume {
            thread,
            checkpoint,
            rows,
            target_node,
        } => {
            let client = graph_client(&config)?;
            let assistant_id = config
                .assistant()
                .map(AssistantId::new)
                .ok_or_else(|| anyhow!("assistant id is not configured"))?;
            let checkpoint: WorkflowCheckpoint = serde_json::from_value(read_json_arg(&checkpoint)?)?;
            let edited_rows = match read_json_arg(&rows)? {
                Value::Array(rows) => rows,
                other => return Err(anyhow!("rows must be a json array: {}", other)),
            };
            let orchestrator = ResumeOrchestrator::new(
                client,
                InMemoryRunRegistry::shared(),
                EventBus::new(config.event_bus_capacity),
                ConnectionTable::new(),
            )
            .with_wait_timeout(config.run_id_wait_timeout());

            let on_event: EventCallback = Arc::new(|event: StreamEvent| {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            });
            let handle = orchestrator
                .resume(
                    ResumeRequest {
                        thread_id: ThreadId::new(thread),
                        assistant_id,
                        checkpoint,
                        edited_rows,
                        target_node,
                    },
                    Some(on_event),
                )
                .await?;
            tracing::info!("resumed as run {}", handle.run_id);
            tokio::select! {
                _ = tokio::signal::ctrl_c() => handle.cleanup.cleanup(),
                _ = handle.cleanup.join() => {}
            }
        }
        Cmd::State { thread } => {
            let client = graph_client(&config)?;
            let state = client.get_state(&ThreadId::new(thread)).await?;
            print_json(&state)?;
        }
        Cmd::History { thread, limit } => {
            let client = graph_client(&config)?;
            let history = client
                .get_history(&ThreadId::new(thread), Some(limit), None)
                .await?;
            if let Some((thread_id, run_id)) = extract_thread_and_run_from_history(&history) {
                tracing::info!("latest run of {} is {}", thread_id, run_id);
            }
            print_json(&history)?;
        }
        Cmd::Logs {
            level,
            module,
            search,
        } => {
            let filter = LogFilter {
                level,
                module,
                search,
            };
            let http = reqwest::Client::new();
            // the connector owns reconnects
            let sse = Arc::new(ReqwestSseSource::new(http.clone(), None, SseRetry::Never));
            let logs = LogStreamConnector::new(
                config.logs_base(),
                sse,
                http,
                config.log_reconnect_delay(),
            )?;
            if !logs.health().await.unwrap_or(false) {
                tracing::warn!("log server at {} is not healthy", config.logs_base());
            }
            let handle = logs.start(Arc::new(move |entry: LogEntry| {
                if filter.matches(&entry) {
                    if let Ok(line) = serde_json::to_string(&entry) {
                        println!("{line}");
                    }
                }
            }))?;
            tokio::signal::ctrl_c().await?;
            handle.stop();
            handle.join().await;
        }
    }
    Ok(())
}
