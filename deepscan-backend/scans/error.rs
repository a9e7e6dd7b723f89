/// Errors from scan control operations (start, reset).
///
/// Failures inside a run never surface here; they end up in the run
/// outcome and the progress stream instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid subject id: {0:?}")]
    InvalidSubject(String),

    #[error("scan already running for {0}")]
    AlreadyRunning(String),

    #[error("checkpoint store: {0}")]
    Store(String),
}
