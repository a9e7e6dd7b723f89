use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::context::RunContext;
use super::Phase;
use crate::experts::Expert;

/// Settled outcome of one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub phase: Phase,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// How a supervised unit of work ended.
pub(crate) enum Settled<T> {
    Finished(T),
    Panicked(JoinError),
    TimedOut,
    /// The run-level deadline fired first.
    Cancelled,
}

/// Wait for `handle` unless `timeout` or the run token wins. A loser is
/// told to stop through `token`, gets `grace` to wind down, then is
/// aborted so it stops consuming resources.
pub(crate) async fn supervise<T>(
    mut handle: JoinHandle<T>,
    timeout: Duration,
    run_cancel: &CancellationToken,
    token: CancellationToken,
    grace: Duration,
) -> Settled<T> {
    let settled = tokio::select! {
        biased;
        joined = &mut handle => match joined {
            Ok(value) => Settled::Finished(value),
            Err(e) => Settled::Panicked(e),
        },
        _ = tokio::time::sleep(timeout) => Settled::TimedOut,
        _ = run_cancel.cancelled() => Settled::Cancelled,
    };

    if matches!(settled, Settled::TimedOut | Settled::Cancelled) {
        token.cancel();
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "Work ignored cancellation, aborting");
            handle.abort();
        }
    }
    settled
}

/// Runs one expert with a timeout and writes exactly one checkpoint for
/// the attempt before returning. Never propagates the expert's failure.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    default_timeout: Duration,
    cancel_grace: Duration,
}

impl TaskRunner {
    pub fn new(default_timeout: Duration, cancel_grace: Duration) -> Self {
        Self {
            default_timeout,
            cancel_grace,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    pub async fn run(&self, expert: Arc<dyn Expert>, ctx: &RunContext) -> TaskResult {
        let name = expert.name().to_string();
        let phase = expert.phase();
        let timeout = expert.timeout().unwrap_or(self.default_timeout);
        let token = ctx.cancel.child_token();
        let started = Instant::now();

        tracing::info!(task = %name, %phase, timeout_s = timeout.as_secs(), "▶ Task started");
        ctx.emitter.progress(&name, format!("Running {name}..."));

        let handle = {
            let expert = Arc::clone(&expert);
            let input = Arc::clone(&ctx.input);
            let emitter = ctx.emitter.clone();
            let token = token.clone();
            tokio::spawn(async move { expert.execute(&input, &emitter, token).await })
        };

        let outcome: Result<(), String> =
            match supervise(handle, timeout, &ctx.cancel, token, self.cancel_grace).await {
                Settled::Finished(Ok(true)) => Ok(()),
                Settled::Finished(Ok(false)) => Err(format!("{name} reported failure")),
                Settled::Finished(Err(e)) => Err(format!("{e:#}")),
                Settled::Panicked(e) => Err(format!("task panicked: {e}")),
                Settled::TimedOut => Err(format!(
                    "{name} timed out after {:.1}s",
                    timeout.as_secs_f64()
                )),
                Settled::Cancelled => Err(format!("{name} cancelled: run deadline exceeded")),
            };

        let success = outcome.is_ok();
        let result = TaskResult {
            name: name.clone(),
            phase,
            success,
            error: outcome.err(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        // Checkpoint first: once `run` returns, the store reflects it.
        if let Err(e) = ctx
            .store
            .record_task_result(ctx.subject(), &name, success, phase)
            .await
        {
            tracing::warn!(task = %name, error = %e, "Failed to write task checkpoint");
        }

        match &result.error {
            None => {
                tracing::info!(task = %name, elapsed_ms = result.elapsed_ms, "✓ Task completed");
                ctx.emitter
                    .task_settled(&result, format!("{name} completed"));
            }
            Some(err_msg) => {
                tracing::error!(task = %name, error = %err_msg, "✗ Task failed");
                if let Err(e) = ctx.store.record_error(ctx.subject(), err_msg, phase).await {
                    tracing::warn!(task = %name, error = %e, "Failed to record task error");
                }
                ctx.emitter.error(&name, Some(&name), err_msg.clone());
            }
        }

        result
    }
}
