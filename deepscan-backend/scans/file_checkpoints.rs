use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::checkpoints::{CheckpointStore, RunRecord, RunState};
use super::{is_valid_subject_id, Phase};

/// Checkpoints kept as one JSON document per subject under
/// `<base_dir>/checkpoints/`, mirrored in memory.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    records: RwLock<HashMap<String, RunRecord>>,
}

impl FileCheckpointStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }

    fn record_file(&self, subject: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("{subject}.json"))
    }

    fn flush(&self, record: &RunRecord) -> Result<()> {
        let dir = self.checkpoints_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoints dir: {}", dir.display()))?;
        let path = self.record_file(&record.subject);
        let content =
            serde_json::to_string_pretty(record).context("failed to serialize run record")?;

        // Write-then-rename so a crash mid-write never leaves a torn record.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write checkpoint file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to replace checkpoint file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `mutate` to the subject's record (creating it on first write)
    /// and flush the result.
    async fn mutate<F>(&self, subject: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RunRecord),
    {
        if !is_valid_subject_id(subject) {
            bail!("invalid subject id: {subject:?}");
        }
        let mut records = self.records.write().await;
        let record = records
            .entry(subject.to_string())
            .or_insert_with(|| RunRecord::new(subject));
        mutate(record);
        self.flush(record)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get_state(&self, subject: &str) -> RunState {
        self.records
            .read()
            .await
            .get(subject)
            .map(RunRecord::state)
            .unwrap_or_default()
    }

    async fn get_record(&self, subject: &str) -> Option<RunRecord> {
        self.records.read().await.get(subject).cloned()
    }

    async fn list_runs(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.records.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        runs
    }

    async fn record_task_result(
        &self,
        subject: &str,
        task: &str,
        success: bool,
        phase: Phase,
    ) -> Result<()> {
        self.mutate(subject, |r| r.record_task(task, success, phase))
            .await
    }

    async fn record_error(&self, subject: &str, message: &str, phase: Phase) -> Result<()> {
        self.mutate(subject, |r| r.record_error(message, phase)).await
    }

    async fn record_crawl(&self, subject: &str, pages: usize) -> Result<()> {
        self.mutate(subject, |r| r.record_crawl(pages)).await
    }

    async fn enter_phase(&self, subject: &str, phase: Phase) -> Result<()> {
        self.mutate(subject, |r| r.advance_phase(phase)).await
    }

    async fn mark_run_started(&self, subject: &str) -> Result<()> {
        self.mutate(subject, RunRecord::mark_started).await
    }

    async fn mark_run_completed(
        &self,
        subject: &str,
        success: bool,
        message: Option<String>,
    ) -> Result<()> {
        self.mutate(subject, |r| r.mark_completed(success, message))
            .await
    }

    async fn reset_all_checkpoints(&self, subject: &str) -> Result<()> {
        if !is_valid_subject_id(subject) {
            bail!("invalid subject id: {subject:?}");
        }
        self.records.write().await.remove(subject);
        let path = self.record_file(subject);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete checkpoint file: {}", path.display()))?;
        }
        tracing::info!(subject, "Checkpoints reset");
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let dir = self.checkpoints_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoints dir: {}", dir.display()))?;

        let mut loaded = HashMap::new();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read checkpoints dir: {}", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read checkpoint file: {}", path.display()))?;
            match serde_json::from_str::<RunRecord>(&content) {
                Ok(record) => {
                    loaded.insert(record.subject.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping invalid checkpoint file");
                }
            }
        }

        let count = loaded.len();
        *self.records.write().await = loaded;
        tracing::info!(count, "Loaded checkpoints");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scans::RunStatus;
    use tempfile::tempdir;

    async fn open(dir: &std::path::Path) -> FileCheckpointStore {
        let store = FileCheckpointStore::new(dir.to_path_buf());
        store.load_all().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_missing_subject_returns_initial_state() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        let state = store.get_state("nobody").await;
        assert!(state.is_fresh());
        assert_eq!(state.status, RunStatus::NotStarted);
        assert!(store.get_record("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_task_results_survive_restart() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        store.mark_run_started("acme").await.unwrap();
        store
            .record_task_result("acme", "tech", true, Phase::ParallelAnalysis)
            .await
            .unwrap();
        store
            .record_task_result("acme", "hosting", false, Phase::ParallelAnalysis)
            .await
            .unwrap();
        drop(store);

        let store2 = open(dir.path()).await;
        let state = store2.get_state("acme").await;
        assert!(state.is_completed("tech"));
        assert!(state.failed_tasks.contains("hosting"));
        assert_eq!(state.current_phase, Phase::ParallelAnalysis);
        assert_eq!(state.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_record_task_result_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        for _ in 0..2 {
            store
                .record_task_result("acme", "costs", true, Phase::SequentialAnalysis)
                .await
                .unwrap();
        }

        let record = store.get_record("acme").await.unwrap();
        assert_eq!(record.tasks.len(), 1);
        assert_eq!(store.get_state("acme").await.completed_tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_tasks_and_phase() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        store
            .record_task_result("acme", "decision", true, Phase::SequentialAnalysis)
            .await
            .unwrap();
        store.record_crawl("acme", 4).await.unwrap();
        store.reset_all_checkpoints("acme").await.unwrap();

        assert!(store.get_state("acme").await.is_fresh());
        assert!(!dir.path().join("checkpoints").join("acme.json").exists());

        let store2 = open(dir.path()).await;
        assert!(store2.get_state("acme").await.is_fresh());
    }

    #[tokio::test]
    async fn test_reset_unknown_subject_is_ok() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.reset_all_checkpoints("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_subject_rejected() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        let err = store
            .record_task_result("../escape", "tech", true, Phase::ParallelAnalysis)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid subject id"));
    }

    #[tokio::test]
    async fn test_crawl_marker_persists() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        store.record_crawl("acme", 7).await.unwrap();
        store.mark_run_completed("acme", true, None).await.unwrap();

        let store2 = open(dir.path()).await;
        assert!(store2.get_state("acme").await.crawl_done);
        assert_eq!(store2.get_record("acme").await.unwrap().crawl_pages, Some(7));
    }

    #[tokio::test]
    async fn test_enter_phase_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        store.enter_phase("acme", Phase::SequentialAnalysis).await.unwrap();
        store.enter_phase("acme", Phase::ParallelAnalysis).await.unwrap();
        assert_eq!(
            store.get_state("acme").await.current_phase,
            Phase::SequentialAnalysis
        );
    }

    #[tokio::test]
    async fn test_mark_run_completed_persists_status() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        store.mark_run_started("acme").await.unwrap();
        store
            .mark_run_completed("acme", false, Some("failed tasks: tech".into()))
            .await
            .unwrap();

        let store2 = open(dir.path()).await;
        let record = store2.get_record("acme").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.phase, Phase::Completed);
        assert_eq!(record.last_error.as_deref(), Some("failed tasks: tech"));
    }

    #[tokio::test]
    async fn test_invalid_files_skipped_on_load() {
        let dir = tempdir().unwrap();
        let cp_dir = dir.path().join("checkpoints");
        std::fs::create_dir_all(&cp_dir).unwrap();
        std::fs::write(cp_dir.join("broken.json"), "{not json").unwrap();
        std::fs::write(cp_dir.join("notes.txt"), "ignored").unwrap();

        let store = open(dir.path()).await;
        assert!(store.list_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;

        store.mark_run_started("older").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.mark_run_started("newer").await.unwrap();

        let runs = store.list_runs().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].subject, "newer");
    }
}
