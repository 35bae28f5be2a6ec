//! Types for task-run execution.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// What kind of body a task profile executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Child process launched from an entrypoint file.
    Script,
    /// In-process cooperative loop resolved from the handler registry.
    Agentic,
    /// Agentic body that may suspend on a waiting-for-user contract.
    InteractiveWrapper,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Script => "script",
            TaskKind::Agentic => "agentic",
            TaskKind::InteractiveWrapper => "interactive_wrapper",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "script" => Some(TaskKind::Script),
            "agentic" => Some(TaskKind::Agentic),
            "interactive_wrapper" => Some(TaskKind::InteractiveWrapper),
            _ => None,
        }
    }
}

/// Terminal (or suspending) status reported by a run body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Done,
    Failed,
    Blocked,
    WaitingForUser,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Done => "done",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Blocked => "blocked",
            OutcomeStatus::WaitingForUser => "waiting_for_user",
        }
    }
}

/// Contract persisted while an interactive run waits for user input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingContract {
    pub request_id: String,
    pub question: String,
    #[serde(default)]
    pub context: Option<String>,
    /// ISO-8601 UTC instant after which housekeeping expires the run.
    pub expires_at: String,
}

/// Result contract returned by every run body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting: Option<WaitingContract>,
}

impl RunOutcome {
    pub fn done(summary: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Done,
            summary: Some(summary.into()),
            error: None,
            artifacts: None,
            waiting: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            summary: None,
            error: Some(error.into()),
            artifacts: None,
            waiting: None,
        }
    }

    pub fn waiting(contract: WaitingContract) -> Self {
        Self {
            status: OutcomeStatus::WaitingForUser,
            summary: None,
            error: None,
            artifacts: None,
            waiting: Some(contract),
        }
    }
}

/// Everything the runner needs to execute one claimed run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: String,
    pub task_id: String,
    pub kind: TaskKind,
    /// Repository-relative entrypoint for script tasks.
    pub entrypoint_path: Option<String>,
    /// Extra argv entries for script tasks.
    pub args: Vec<String>,
    /// Handler name for agentic / interactive tasks.
    pub module: Option<String>,
    pub timeout: Duration,
    pub payload: Value,
}

impl RunSpec {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
            kind,
            entrypoint_path: None,
            args: Vec::new(),
            module: None,
            timeout: Duration::from_secs(30 * 60),
            payload: Value::Null,
        }
    }
}

/// Execution context handed to agentic / interactive handlers.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: String,
    pub task_id: String,
    pub payload: Value,
    /// Observed at suspension points; set when the run is killed.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// The user response merged into the payload by a resume, if any.
    pub fn user_response(&self) -> Option<&Value> {
        self.payload.get("user_response")
    }
}

/// Runner errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("run cancelled")]
    Cancelled,

    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    #[error("no handler registered for module `{0}`")]
    MissingHandler(String),

    #[error("invalid entrypoint: {0}")]
    InvalidEntrypoint(String),

    #[error("failed to spawn `{path}`: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
