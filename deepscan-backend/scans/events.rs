use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::coordinator::RunOutcome;
use super::task_runner::TaskResult;

/// Component label for events that don't come from a named expert.
pub const SOURCE_COORDINATOR: &str = "coordinator";
pub const SOURCE_SCHEDULER: &str = "scheduler";
pub const SOURCE_CRAWLER: &str = "crawler";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub subject: String,
    pub run_id: String,
    /// Emit order within a run, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub message: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskResult>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
    },
    Completed {
        outcome: RunOutcome,
    },
}

impl EventKind {
    pub fn message() -> Self {
        EventKind::Progress {
            percent: None,
            task: None,
        }
    }

    pub fn percent(percent: u8) -> Self {
        EventKind::Progress {
            percent: Some(percent.min(100)),
            task: None,
        }
    }

    pub fn as_sse_event(&self) -> &'static str {
        match self {
            EventKind::Progress { .. } => "progress",
            EventKind::Error { .. } => "error",
            EventKind::Completed { .. } => "completed",
        }
    }
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Completed { .. })
    }
}
