//! Run lifecycle and run creation payloads.

use crate::types::checkpoint::WorkflowCheckpoint;
use crate::types::ids::{AssistantId, RunId, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Error
        )
    }
}

/// One execution attempt of a thread's workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    pub thread_id: ThreadId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: RunId, thread_id: ThreadId) -> Self {
        Self {
            run_id,
            thread_id,
            status: RunStatus::Pending,
            started_at: Utc::now(),
        }
    }

    /// Advance the status. Terminal states are sticky.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if self.status.is_terminal() || self.status == next {
            return false;
        }
        self.status = next;
        true
    }
}

/// Stream modes understood by the graph service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Values,
    Messages,
    Updates,
    Events,
    Debug,
}

pub fn default_stream_modes() -> Vec<StreamMode> {
    vec![StreamMode::Values, StreamMode::Messages]
}

/// `command` object of a run creation request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
}

impl Command {
    /// `{ resume: { risk_data: rows }, goto? }`
    pub fn resume_with_risk_data(rows: Vec<Value>, goto: Option<String>) -> Self {
        Self {
            resume: Some(serde_json::json!({ "risk_data": rows })),
            goto,
            update: None,
        }
    }
}

/// Body of `POST /threads/{thread_id}/runs` (and `/runs/stream`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub assistant_id: AssistantId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<WorkflowCheckpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_mode: Vec<StreamMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl CreateRunRequest {
    pub fn new(assistant_id: AssistantId) -> Self {
        Self {
            assistant_id,
            input: None,
            checkpoint: None,
            command: None,
            stream_mode: Vec::new(),
            config: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: WorkflowCheckpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_stream_mode(mut self, modes: Vec<StreamMode>) -> Self {
        self.stream_mode = modes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resume_command_shape() {
        let rows = vec![json!({"Id": "R1", "Nível de Risco": "Alto"})];
        let cmd = Command::resume_with_risk_data(rows.clone(), Some("analyze_hazards".into()));
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["resume"]["risk_data"], json!(rows));
        assert_eq!(v["goto"], "analyze_hazards");
        assert!(v.get("update").is_none());

        let no_goto = serde_json::to_value(Command::resume_with_risk_data(vec![], None)).unwrap();
        assert!(no_goto.get("goto").is_none());
    }

    #[test]
    fn test_run_terminal_states_are_sticky() {
        let mut run = Run::new(RunId::new("R1"), ThreadId::new("T1"));
        assert!(run.transition(RunStatus::Streaming));
        assert!(run.transition(RunStatus::Completed));
        assert!(!run.transition(RunStatus::Streaming));
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn test_create_run_request_serialization() {
        let req = CreateRunRequest::new(AssistantId::new("agent"))
            .with_stream_mode(default_stream_modes());
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["assistant_id"], "agent");
        assert_eq!(v["stream_mode"], json!(["values", "messages"]));
        assert!(v.get("checkpoint").is_none());
    }
}
