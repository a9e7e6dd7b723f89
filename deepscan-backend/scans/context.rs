use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::checkpoints::CheckpointStore;
use super::progress::ProgressEmitter;
use crate::experts::ExpertInput;

/// Everything one run needs, passed down the call chain instead of living
/// in globals, so concurrent runs for different subjects never share
/// deadlines or emitters.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub input: Arc<ExpertInput>,
    pub store: Arc<dyn CheckpointStore>,
    pub emitter: ProgressEmitter,
    /// Fires when the whole-run deadline expires. Parent of every task's
    /// own token.
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn subject(&self) -> &str {
        &self.input.subject_id
    }

    pub fn deadline_passed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
