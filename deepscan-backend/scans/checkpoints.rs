use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Phase, RunStatus};

/// One attempt outcome for a named task. A name appears at most once per
/// subject; a later attempt replaces the earlier entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub task: String,
    pub success: bool,
    pub phase: Phase,
    pub recorded_at: DateTime<Utc>,
}

/// Durable state of the latest run for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub subject: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskCheckpoint>,
    /// Set once a crawl ran to completion. Run completion leaves it alone,
    /// so only a reset brings the crawl back.
    #[serde(default)]
    pub crawled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub crawl_pages: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            phase: Phase::default(),
            status: RunStatus::default(),
            last_error: None,
            tasks: BTreeMap::new(),
            crawled_at: None,
            crawl_pages: None,
            started_at: None,
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Phase never moves backwards outside of a reset.
    pub fn advance_phase(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
        self.updated_at = Utc::now();
    }

    pub fn record_task(&mut self, task: &str, success: bool, phase: Phase) {
        let now = Utc::now();
        self.tasks.insert(
            task.to_string(),
            TaskCheckpoint {
                task: task.to_string(),
                success,
                phase,
                recorded_at: now,
            },
        );
        self.advance_phase(phase);
    }

    pub fn record_crawl(&mut self, pages: usize) {
        let now = Utc::now();
        self.crawled_at = Some(now);
        self.crawl_pages = Some(pages);
        self.updated_at = now;
    }

    pub fn record_error(&mut self, message: &str, phase: Phase) {
        self.last_error = Some(format!("[{phase}] {message}"));
        self.updated_at = Utc::now();
    }

    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.status = RunStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.status = if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.phase = Phase::Completed;
        if message.is_some() {
            self.last_error = message;
        }
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn state(&self) -> RunState {
        let mut completed_tasks = BTreeSet::new();
        let mut failed_tasks = BTreeSet::new();
        for cp in self.tasks.values() {
            if cp.success {
                completed_tasks.insert(cp.task.clone());
            } else {
                failed_tasks.insert(cp.task.clone());
            }
        }
        RunState {
            completed_tasks,
            failed_tasks,
            current_phase: self.phase,
            crawl_done: self.crawled_at.is_some(),
            status: self.status,
            last_error: self.last_error.clone(),
        }
    }
}

/// Snapshot the scheduler uses for resume decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub completed_tasks: BTreeSet<String>,
    pub failed_tasks: BTreeSet<String>,
    pub current_phase: Phase,
    /// A previous crawl finished; resume skips phase 1 only then.
    pub crawl_done: bool,
    pub status: RunStatus,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn is_completed(&self, task: &str) -> bool {
        self.completed_tasks.contains(task)
    }

    /// True when nothing has been recorded yet, i.e. this is a fresh run
    /// rather than a resume.
    pub fn is_fresh(&self) -> bool {
        self.completed_tasks.is_empty()
            && self.failed_tasks.is_empty()
            && !self.crawl_done
            && self.current_phase == Phase::Crawling
    }
}

/// Durable checkpoints for scan runs.
///
/// Writes are best-effort from the pipeline's point of view: a failed
/// write loses resumability, not correctness, so callers log and move on.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Never fails; an unknown subject yields the initial state.
    async fn get_state(&self, subject: &str) -> RunState;
    async fn get_record(&self, subject: &str) -> Option<RunRecord>;
    async fn list_runs(&self) -> Vec<RunRecord>;

    async fn record_task_result(
        &self,
        subject: &str,
        task: &str,
        success: bool,
        phase: Phase,
    ) -> Result<()>;
    async fn record_error(&self, subject: &str, message: &str, phase: Phase) -> Result<()>;
    /// Marks the crawl as finished with `pages` pages.
    async fn record_crawl(&self, subject: &str, pages: usize) -> Result<()>;
    async fn enter_phase(&self, subject: &str, phase: Phase) -> Result<()>;

    async fn mark_run_started(&self, subject: &str) -> Result<()>;
    async fn mark_run_completed(
        &self,
        subject: &str,
        success: bool,
        message: Option<String>,
    ) -> Result<()>;

    /// Drops every task checkpoint, the crawl marker and the phase marker
    /// for `subject`.
    async fn reset_all_checkpoints(&self, subject: &str) -> Result<()>;

    async fn load_all(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_never_regresses() {
        let mut record = RunRecord::new("s1");
        record.advance_phase(Phase::SequentialAnalysis);
        record.advance_phase(Phase::ParallelAnalysis);
        assert_eq!(record.phase, Phase::SequentialAnalysis);
    }

    #[test]
    fn test_record_task_is_last_write_wins() {
        let mut record = RunRecord::new("s1");
        record.record_task("tech", false, Phase::ParallelAnalysis);
        record.record_task("tech", true, Phase::ParallelAnalysis);
        assert_eq!(record.tasks.len(), 1);

        let state = record.state();
        assert!(state.is_completed("tech"));
        assert!(state.failed_tasks.is_empty());
        assert_eq!(state.current_phase, Phase::ParallelAnalysis);
    }

    #[test]
    fn test_state_splits_success_and_failure() {
        let mut record = RunRecord::new("s1");
        record.record_task("tech", false, Phase::ParallelAnalysis);
        record.record_task("hosting", true, Phase::ParallelAnalysis);

        let state = record.state();
        assert_eq!(state.completed_tasks.len(), 1);
        assert!(state.failed_tasks.contains("tech"));
        assert!(!state.is_fresh());
    }

    #[test]
    fn test_mark_started_clears_previous_error() {
        let mut record = RunRecord::new("s1");
        record.record_error("boom", Phase::Crawling);
        assert_eq!(record.last_error.as_deref(), Some("[crawling] boom"));

        record.mark_started();
        assert_eq!(record.status, RunStatus::Running);
        assert!(record.last_error.is_none());
        assert!(record.started_at.is_some());
    }

    #[test]
    fn test_mark_completed_sets_terminal_phase() {
        let mut record = RunRecord::new("s1");
        record.mark_started();
        record.mark_completed(false, Some("failed: tech".into()));
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.phase, Phase::Completed);
        assert_eq!(record.last_error.as_deref(), Some("failed: tech"));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_crawl_marker_survives_run_completion() {
        let mut record = RunRecord::new("s1");
        record.advance_phase(Phase::SequentialAnalysis);
        record.mark_completed(false, None);
        assert!(!record.state().crawl_done);

        record.record_crawl(12);
        record.mark_started();
        record.mark_completed(true, None);
        let state = record.state();
        assert!(state.crawl_done);
        assert!(!state.is_fresh());
        assert_eq!(record.crawl_pages, Some(12));
    }

    #[test]
    fn test_default_state_is_fresh() {
        let state = RunState::default();
        assert!(state.is_fresh());
        assert_eq!(state.status, RunStatus::NotStarted);
    }
}
