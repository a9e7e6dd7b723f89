use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::context::{prompt_vars, render_prompt};
use super::estimate::{estimate, EntityInventory};
use super::executors::Executor;
use super::results::ResultStore;
use super::{Expert, ExpertInput};
use crate::crawl::page_index::FilePageIndex;
use crate::scans::progress::ProgressEmitter;
use crate::scans::Phase;

/// How an answer becomes a saved result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    /// The answer is saved as is.
    #[default]
    Markdown,
    /// The answer is an entity inventory. It is priced and saved as a
    /// markdown report plus the estimate as JSON.
    Estimate,
}

/// An expert defined by a prompt template. Renders the template against
/// the crawled corpus and earlier results, runs it through an executor and
/// saves the answer for later experts.
pub struct PromptExpert {
    name: String,
    phase: Phase,
    template: String,
    timeout: Option<Duration>,
    /// Experts whose saved output is passed in as `{{prior_results}}`.
    uses: Vec<String>,
    format: ResultFormat,
    executor: Arc<dyn Executor>,
    pages: Arc<FilePageIndex>,
    results: ResultStore,
}

impl PromptExpert {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        phase: Phase,
        template: impl Into<String>,
        timeout: Option<Duration>,
        uses: Vec<String>,
        executor: Arc<dyn Executor>,
        pages: Arc<FilePageIndex>,
        results: ResultStore,
    ) -> Self {
        Self {
            name: name.into(),
            phase,
            template: template.into(),
            timeout,
            uses,
            format: ResultFormat::Markdown,
            executor,
            pages,
            results,
        }
    }

    pub fn with_format(mut self, format: ResultFormat) -> Self {
        self.format = format;
        self
    }

    async fn save_estimate(&self, input: &ExpertInput, answer: &str) -> Result<Option<PathBuf>> {
        let inventory = match EntityInventory::from_answer(answer) {
            Ok(inventory) => inventory,
            Err(e) => {
                tracing::warn!(expert = %self.name, error = %format!("{e:#}"), "Answer is not a usable entity inventory");
                return Ok(None);
            }
        };
        let estimate = estimate(&inventory);
        let project = inventory
            .project_name
            .as_deref()
            .unwrap_or_else(|| input.context.display_name());
        let subject = input.subject_id.as_str();

        self.results.save_json(subject, &self.name, &estimate).await?;
        let report = estimate.render_markdown(project, inventory.migration.as_ref());
        let path = self.results.save(subject, &self.name, &report).await?;
        tracing::info!(
            expert = %self.name,
            total_hours = format_args!("{:.1}", estimate.total_hours),
            entities = estimate.breakdown.len(),
            "Estimate computed"
        );
        Ok(Some(path))
    }
}

#[async_trait]
impl Expert for PromptExpert {
    fn name(&self) -> &str {
        &self.name
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        input: &ExpertInput,
        emit: &ProgressEmitter,
        cancel: CancellationToken,
    ) -> Result<bool> {
        let subject = input.subject_id.as_str();
        let pages = self.pages.load_pages(subject).await?;
        let prior = self.results.load_many(subject, &self.uses).await?;
        let prompt = render_prompt(&self.template, &prompt_vars(input, &pages, &prior));

        let work_dir = self.results.subject_dir(subject)?;
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("failed to create work dir: {}", work_dir.display()))?;

        emit.progress(
            &self.name,
            format!(
                "{} analyzing {} pages, {} earlier results",
                self.name,
                pages.len(),
                prior.len()
            ),
        );
        let result = self.executor.execute(&prompt, &work_dir, cancel).await?;

        if result.text.trim().is_empty() {
            tracing::warn!(expert = %self.name, "Executor returned no output");
            return Ok(false);
        }

        let path = match self.format {
            ResultFormat::Markdown => self.results.save(subject, &self.name, &result.text).await?,
            ResultFormat::Estimate => match self.save_estimate(input, &result.text).await? {
                Some(path) => path,
                None => return Ok(false),
            },
        };
        tracing::info!(
            expert = %self.name,
            cost = format_args!("${:.4}", result.cost_usd),
            turns = result.num_turns,
            path = %path.display(),
            "Result saved"
        );
        Ok(true)
    }
}
