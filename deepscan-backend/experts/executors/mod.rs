pub mod claude_code;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub text: String,
    pub cost_usd: f64,
    pub num_turns: u64,
}

/// Runs one rendered prompt. Implementations stop their work when
/// `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult>;
}
