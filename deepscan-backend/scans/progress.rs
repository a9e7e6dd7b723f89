use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::stream::Stream;
use tokio::sync::broadcast::{self, error::RecvError};

use super::coordinator::RunOutcome;
use super::events::{EventKind, ProgressEvent};
use super::task_runner::TaskResult;

pub const DEFAULT_BACKLOG: usize = 1024;

/// Fan-out hub for progress events. Sending never blocks: a consumer that
/// falls more than the backlog behind loses the oldest events and is told
/// how many it skipped.
#[derive(Clone)]
pub struct ProgressChannel {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressChannel {
    pub fn new(backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog.max(1));
        Self { tx }
    }

    /// Producer handle for one run.
    pub fn emitter(&self, subject: &str, run_id: &str) -> ProgressEmitter {
        ProgressEmitter {
            inner: Arc::new(EmitterInner {
                subject: subject.to_string(),
                run_id: run_id.to_string(),
                tx: self.tx.clone(),
                seq: Mutex::new(0),
            }),
        }
    }

    /// Observer for one subject. Subscribe before starting the run to see
    /// every event; later subscribers only see what follows.
    pub fn subscribe(&self, subject: &str) -> ProgressStream {
        ProgressStream {
            rx: self.tx.subscribe(),
            subject: subject.to_string(),
            done: false,
        }
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

struct EmitterInner {
    subject: String,
    run_id: String,
    tx: broadcast::Sender<ProgressEvent>,
    seq: Mutex<u64>,
}

/// The single emit function shared by everything that runs inside a scan.
#[derive(Clone)]
pub struct ProgressEmitter {
    inner: Arc<EmitterInner>,
}

impl ProgressEmitter {
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Stamps and publishes one event. Emits are serialized so `seq` order
    /// equals publish order even when phase-2 tasks emit concurrently.
    pub fn emit(&self, source: &str, message: impl Into<String>, kind: EventKind) {
        let mut seq = match self.inner.seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *seq += 1;
        let event = ProgressEvent {
            subject: self.inner.subject.clone(),
            run_id: self.inner.run_id.clone(),
            seq: *seq,
            timestamp: Utc::now(),
            source: source.to_string(),
            message: message.into(),
            kind,
        };
        // No receivers is fine: the pipeline never waits on observers.
        let _ = self.inner.tx.send(event);
    }

    pub fn progress(&self, source: &str, message: impl Into<String>) {
        self.emit(source, message, EventKind::message());
    }

    pub fn percent(&self, source: &str, percent: u8, message: impl Into<String>) {
        self.emit(source, message, EventKind::percent(percent));
    }

    pub fn task_settled(&self, result: &TaskResult, message: impl Into<String>) {
        self.emit(
            &result.name,
            message,
            EventKind::Progress {
                percent: None,
                task: Some(result.clone()),
            },
        );
    }

    pub fn error(&self, source: &str, task: Option<&str>, message: impl Into<String>) {
        self.emit(
            source,
            message,
            EventKind::Error {
                task: task.map(String::from),
            },
        );
    }

    pub fn completed(&self, source: &str, outcome: RunOutcome, message: impl Into<String>) {
        self.emit(source, message, EventKind::Completed { outcome });
    }
}

/// Ordered view of one subject's events, ending after its `completed`
/// event or when the hub shuts down.
pub struct ProgressStream {
    rx: broadcast::Receiver<ProgressEvent>,
    subject: String,
    done: bool,
}

impl ProgressStream {
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.subject != self.subject {
                        continue;
                    }
                    if event.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(subject = %self.subject, skipped = n, "Progress subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = ProgressEvent> {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }
}
