pub mod checkpoints;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod file_checkpoints;
pub mod progress;
pub mod scheduler;
pub mod task_runner;

use serde::{Deserialize, Serialize};

/// Longest subject id accepted; ids double as checkpoint file names.
pub const MAX_SUBJECT_ID_LEN: usize = 128;

/// Ordered stages of a scan. The derived ordering is the pipeline order,
/// so "has the run reached X" is a plain comparison.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Crawling,
    ParallelAnalysis,
    SequentialAnalysis,
    Completed,
}

impl Phase {
    /// The stage after this one; `Completed` is terminal.
    pub fn next(self) -> Phase {
        match self {
            Phase::Crawling => Phase::ParallelAnalysis,
            Phase::ParallelAnalysis => Phase::SequentialAnalysis,
            Phase::SequentialAnalysis | Phase::Completed => Phase::Completed,
        }
    }

    /// Phases that experts can be declared in.
    pub fn is_analysis(self) -> bool {
        matches!(self, Phase::ParallelAnalysis | Phase::SequentialAnalysis)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Crawling => "crawling",
            Phase::ParallelAnalysis => "parallel_analysis",
            Phase::SequentialAnalysis => "sequential_analysis",
            Phase::Completed => "completed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// What the experts get to know about the subject besides its id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectContext {
    pub url: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl SubjectContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.url)
    }
}

/// Subject ids are used verbatim as file and directory names, so only a
/// conservative character set is allowed.
pub fn is_valid_subject_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SUBJECT_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
