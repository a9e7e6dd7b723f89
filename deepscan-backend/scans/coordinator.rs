use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::checkpoints::CheckpointStore;
use super::context::RunContext;
use super::error::ScanError;
use super::events::SOURCE_COORDINATOR;
use super::progress::ProgressChannel;
use super::scheduler::{CrawlSettings, PhaseScheduler};
use super::task_runner::TaskRunner;
use super::{is_valid_subject_id, SubjectContext};
use crate::crawl::{Crawler, PageIndexer};
use crate::experts::{ExpertInput, Roster};

pub const DEFAULT_SUCCESS_PERCENT: u8 = 70;

/// A run succeeds when at least `percent` of the full roster succeeded,
/// rounded up: 70% of 10 experts is 7, 70% of 4 is 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessPolicy {
    percent: u8,
}

impl SuccessPolicy {
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.clamp(1, 100),
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn required(&self, total: usize) -> usize {
        (total * usize::from(self.percent)).div_ceil(100)
    }

    pub fn is_success(&self, succeeded: usize, total: usize) -> bool {
        total > 0 && succeeded >= self.required(total)
    }
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_PERCENT)
    }
}

/// Final verdict of a run. Task lists follow roster declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    /// Neither succeeded nor failed, e.g. skipped after the run deadline.
    pub not_attempted: Vec<String>,
    pub total_tasks: usize,
    pub required_tasks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn tally(
        roster: &Roster,
        policy: SuccessPolicy,
        succeeded: &BTreeSet<String>,
        failed: &BTreeSet<String>,
    ) -> Self {
        let mut outcome = RunOutcome {
            total_tasks: roster.len(),
            required_tasks: policy.required(roster.len()),
            ..Default::default()
        };
        for name in roster.names() {
            if succeeded.contains(name) {
                outcome.completed_tasks.push(name.to_string());
            } else if failed.contains(name) {
                outcome.failed_tasks.push(name.to_string());
            } else {
                outcome.not_attempted.push(name.to_string());
            }
        }
        outcome.success = policy.is_success(outcome.completed_tasks.len(), outcome.total_tasks);
        outcome
    }

    /// "failed tasks: a, b; not attempted: c", or `None` when every task
    /// succeeded.
    pub fn failure_summary(&self) -> Option<String> {
        let mut parts = Vec::new();
        if !self.failed_tasks.is_empty() {
            parts.push(format!("failed tasks: {}", self.failed_tasks.join(", ")));
        }
        if !self.not_attempted.is_empty() {
            parts.push(format!("not attempted: {}", self.not_attempted.join(", ")));
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

/// Orchestration knobs, usually built from `Config`.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub task_timeout: Duration,
    pub crawl_timeout: Duration,
    pub run_deadline: Duration,
    pub max_pages: usize,
    pub crawl_progress_step: u8,
    pub success_percent: u8,
    pub cancel_grace: Duration,
    pub with_screenshots: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(120),
            crawl_timeout: Duration::from_secs(300),
            run_deadline: Duration::from_secs(1800),
            max_pages: 50,
            crawl_progress_step: 2,
            success_percent: DEFAULT_SUCCESS_PERCENT,
            cancel_grace: Duration::from_secs(5),
            with_screenshots: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub force_reset: bool,
}

/// A started run. Dropping the handle does not stop the run.
pub struct RunHandle {
    pub run_id: String,
    pub subject: String,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub async fn wait(self) -> RunOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome {
                error: Some(format!("run task failed: {e}")),
                ..Default::default()
            },
        }
    }
}

/// Marks a subject busy for as long as its run is alive.
struct ActiveRun {
    active: Arc<Mutex<HashSet<String>>>,
    subject: String,
}

impl ActiveRun {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, subject: &str) -> Result<Self, ScanError> {
        let mut set = lock(active);
        if !set.insert(subject.to_string()) {
            return Err(ScanError::AlreadyRunning(subject.to_string()));
        }
        Ok(Self {
            active: Arc::clone(active),
            subject: subject.to_string(),
        })
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.subject);
    }
}

fn lock(active: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owns run lifecycle: the single-run-per-subject rule, the run deadline,
/// the success verdict and the run status in the checkpoint store.
pub struct RunCoordinator {
    scheduler: Arc<PhaseScheduler>,
    store: Arc<dyn CheckpointStore>,
    channel: ProgressChannel,
    policy: SuccessPolicy,
    run_deadline: Duration,
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunCoordinator {
    pub fn new(
        roster: Roster,
        crawler: Arc<dyn Crawler>,
        indexer: Arc<dyn PageIndexer>,
        store: Arc<dyn CheckpointStore>,
        channel: ProgressChannel,
        settings: &ScanSettings,
    ) -> Self {
        let runner = TaskRunner::new(settings.task_timeout, settings.cancel_grace);
        let crawl = CrawlSettings {
            max_pages: settings.max_pages,
            with_screenshots: settings.with_screenshots,
            timeout: settings.crawl_timeout,
            progress_step: settings.crawl_progress_step,
        };
        Self {
            scheduler: Arc::new(PhaseScheduler::new(roster, crawler, indexer, runner, crawl)),
            store,
            channel,
            policy: SuccessPolicy::new(settings.success_percent),
            run_deadline: settings.run_deadline,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn channel(&self) -> &ProgressChannel {
        &self.channel
    }

    pub fn roster(&self) -> &Roster {
        self.scheduler.roster()
    }

    pub fn policy(&self) -> SuccessPolicy {
        self.policy
    }

    pub fn is_running(&self, subject: &str) -> bool {
        lock(&self.active).contains(subject)
    }

    pub fn active_runs(&self) -> Vec<String> {
        let mut subjects: Vec<String> = lock(&self.active).iter().cloned().collect();
        subjects.sort();
        subjects
    }

    /// Starts a run in the background. Subscribe to the channel before
    /// calling this to observe every event of the run.
    pub fn start(
        self: &Arc<Self>,
        subject: &str,
        context: SubjectContext,
        options: StartOptions,
    ) -> Result<RunHandle, ScanError> {
        if !is_valid_subject_id(subject) {
            return Err(ScanError::InvalidSubject(subject.to_string()));
        }
        let guard = ActiveRun::acquire(&self.active, subject)?;
        let run_id = uuid::Uuid::new_v4().to_string();

        let join = {
            let coordinator = Arc::clone(self);
            let run_id = run_id.clone();
            let subject = subject.to_string();
            tokio::spawn(async move {
                let outcome = coordinator
                    .execute(&run_id, &subject, context, options)
                    .await;
                drop(guard);
                outcome
            })
        };

        Ok(RunHandle {
            run_id,
            subject: subject.to_string(),
            join,
        })
    }

    /// Starts a run and waits for its outcome.
    pub async fn run(
        self: &Arc<Self>,
        subject: &str,
        context: SubjectContext,
        options: StartOptions,
    ) -> Result<RunOutcome, ScanError> {
        Ok(self.start(subject, context, options)?.wait().await)
    }

    /// Clears every checkpoint for `subject` so the next run starts fresh.
    pub async fn reset(&self, subject: &str) -> Result<(), ScanError> {
        if !is_valid_subject_id(subject) {
            return Err(ScanError::InvalidSubject(subject.to_string()));
        }
        // Hold the subject while resetting so a run can't start underneath.
        let _guard = ActiveRun::acquire(&self.active, subject)?;
        self.store
            .reset_all_checkpoints(subject)
            .await
            .map_err(|e| ScanError::Store(format!("{e:#}")))
    }

    async fn execute(
        &self,
        run_id: &str,
        subject: &str,
        context: SubjectContext,
        options: StartOptions,
    ) -> RunOutcome {
        let short_id = &run_id[..8.min(run_id.len())];
        let span = tracing::info_span!("scan_run", subject = %subject, run = %short_id);
        let emitter = self.channel.emitter(subject, run_id);
        let started = Instant::now();

        tracing::info!(
            parent: &span,
            url = %context.url,
            experts = self.roster().len(),
            force_reset = options.force_reset,
            "▶ Scan started"
        );
        emitter.progress(
            SOURCE_COORDINATOR,
            format!("Starting deep scan of {}", context.display_name()),
        );

        if options.force_reset {
            match self.store.reset_all_checkpoints(subject).await {
                Ok(()) => emitter.progress(SOURCE_COORDINATOR, "Checkpoints cleared, starting fresh"),
                Err(e) => tracing::warn!(parent: &span, error = %e, "Failed to reset checkpoints"),
            }
        }
        if let Err(e) = self.store.mark_run_started(subject).await {
            tracing::warn!(parent: &span, error = %e, "Failed to mark run started");
        }

        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            let limit = self.run_deadline;
            tokio::spawn(
                async move {
                    tokio::time::sleep(limit).await;
                    tracing::warn!(deadline_s = limit.as_secs(), "Run deadline reached, cancelling");
                    cancel.cancel();
                }
                .instrument(span.clone()),
            )
        };

        let ctx = RunContext {
            run_id: run_id.to_string(),
            input: Arc::new(ExpertInput {
                subject_id: subject.to_string(),
                context,
            }),
            store: Arc::clone(&self.store),
            emitter: emitter.clone(),
            cancel,
        };
        let drive = {
            let scheduler = Arc::clone(&self.scheduler);
            let ctx = ctx.clone();
            tokio::spawn(async move { scheduler.drive(&ctx).await }.instrument(span.clone()))
        };
        let joined = drive.await;
        deadline.abort();

        let outcome = match joined {
            Ok(report) => {
                let mut outcome =
                    RunOutcome::tally(self.roster(), self.policy, &report.succeeded, &report.failed);
                outcome.error = match (report.deadline_hit, outcome.failure_summary()) {
                    (true, Some(summary)) => Some(format!("run deadline exceeded; {summary}")),
                    (true, None) => Some("run deadline exceeded".to_string()),
                    (false, summary) => summary,
                };
                outcome
            }
            Err(e) => {
                let message = format!("scan aborted: {e}");
                tracing::error!(parent: &span, error = %message, "Scheduler crashed");
                let state = self
                    .store
                    .get_record(subject)
                    .await
                    .map(|r| r.state())
                    .unwrap_or_default();
                if let Err(store_err) = self
                    .store
                    .record_error(subject, &message, state.current_phase)
                    .await
                {
                    tracing::warn!(parent: &span, error = %store_err, "Failed to record scan error");
                }
                emitter.error(SOURCE_COORDINATOR, None, message.clone());

                let mut outcome = RunOutcome::tally(
                    self.roster(),
                    self.policy,
                    &state.completed_tasks,
                    &state.failed_tasks,
                );
                outcome.success = false;
                outcome.error = Some(message);
                outcome
            }
        };

        if let Err(e) = self
            .store
            .mark_run_completed(subject, outcome.success, outcome.error.clone())
            .await
        {
            tracing::warn!(parent: &span, error = %e, "Failed to mark run completed");
        }

        let elapsed = started.elapsed().as_secs_f64();
        let succeeded = outcome.completed_tasks.len();
        let message = if outcome.success {
            tracing::info!(
                parent: &span,
                elapsed = format_args!("{elapsed:.1}s"),
                succeeded,
                total = outcome.total_tasks,
                "✓ Scan completed"
            );
            format!(
                "Deep scan complete: {succeeded}/{} experts succeeded in {elapsed:.1}s",
                outcome.total_tasks
            )
        } else {
            tracing::error!(
                parent: &span,
                elapsed = format_args!("{elapsed:.1}s"),
                succeeded,
                required = outcome.required_tasks,
                error = outcome.error.as_deref().unwrap_or("unknown error"),
                "✗ Scan failed"
            );
            format!(
                "Deep scan failed: {succeeded}/{} experts succeeded, {} required",
                outcome.total_tasks, outcome.required_tasks
            )
        };
        emitter.completed(SOURCE_COORDINATOR, outcome.clone(), message);

        outcome
    }
}
