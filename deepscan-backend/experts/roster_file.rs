use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::executors::claude_code::ClaudeCodeExecutor;
use super::executors::Executor;
use super::prompt_expert::{PromptExpert, ResultFormat};
use super::results::ResultStore;
use super::{Expert, Roster};
use crate::crawl::page_index::FilePageIndex;
use crate::scans::Phase;

/// Roster shipped with the binary, used when no roster file exists.
pub const DEFAULT_ROSTER: &str = include_str!("../../static/roster.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertPhase {
    Parallel,
    Sequential,
}

impl From<ExpertPhase> for Phase {
    fn from(phase: ExpertPhase) -> Self {
        match phase {
            ExpertPhase::Parallel => Phase::ParallelAnalysis,
            ExpertPhase::Sequential => Phase::SequentialAnalysis,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpertSpec {
    pub name: String,
    pub phase: ExpertPhase,
    pub prompt: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Experts whose results this one reads. Defaults to nothing for
    /// parallel experts and to everything declared before it for
    /// sequential ones.
    #[serde(default)]
    pub uses: Option<Vec<String>>,
    /// `estimate` makes the answer an entity inventory that is priced
    /// before saving.
    #[serde(default)]
    pub output: ResultFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterFile {
    /// Tools the executor may use; empty means unrestricted.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub append_system_prompt: Option<String>,
    pub experts: Vec<ExpertSpec>,
}

impl RosterFile {
    pub fn parse(yaml: &str) -> Result<Self> {
        let file: RosterFile = serde_yaml::from_str(yaml).context("failed to parse roster YAML")?;
        file.validate()?;
        Ok(file)
    }

    /// Reads `path`, or falls back to the built-in roster when it is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No roster file, using built-in roster");
            return Self::parse(DEFAULT_ROSTER);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading roster file: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid roster file: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let names: HashSet<&str> = self.experts.iter().map(|e| e.name.as_str()).collect();
        for spec in &self.experts {
            if spec.prompt.trim().is_empty() {
                bail!("expert {} has an empty prompt", spec.name);
            }
            if spec.timeout_secs == Some(0) {
                bail!("expert {} has a zero timeout", spec.name);
            }
            for dep in spec.uses.iter().flatten() {
                if dep == &spec.name {
                    bail!("expert {} uses its own result", spec.name);
                }
                if !names.contains(dep.as_str()) {
                    bail!("expert {} uses unknown expert {dep}", spec.name);
                }
            }
        }
        Ok(())
    }

    pub fn executor(&self) -> ClaudeCodeExecutor {
        ClaudeCodeExecutor::new(self.permissions.clone(), self.append_system_prompt.clone())
    }

    /// Builds the roster; duplicate names and an empty list are rejected here.
    pub fn into_roster(
        self,
        executor: Arc<dyn Executor>,
        pages: Arc<FilePageIndex>,
        results: ResultStore,
    ) -> Result<Roster> {
        let parallel: Vec<String> = self
            .experts
            .iter()
            .filter(|e| e.phase == ExpertPhase::Parallel)
            .map(|e| e.name.clone())
            .collect();
        let mut earlier_sequential: Vec<String> = Vec::new();

        let mut experts: Vec<Arc<dyn Expert>> = Vec::with_capacity(self.experts.len());
        for spec in self.experts {
            let uses = match (spec.uses, spec.phase) {
                (Some(uses), _) => uses,
                (None, ExpertPhase::Parallel) => vec![],
                (None, ExpertPhase::Sequential) => parallel
                    .iter()
                    .chain(earlier_sequential.iter())
                    .cloned()
                    .collect(),
            };
            if spec.phase == ExpertPhase::Sequential {
                earlier_sequential.push(spec.name.clone());
            }
            let expert = PromptExpert::new(
                spec.name,
                spec.phase.into(),
                spec.prompt,
                spec.timeout_secs.map(Duration::from_secs),
                uses,
                Arc::clone(&executor),
                Arc::clone(&pages),
                results.clone(),
            )
            .with_format(spec.output);
            experts.push(Arc::new(expert));
        }
        Ok(Roster::new(experts)?)
    }
}
