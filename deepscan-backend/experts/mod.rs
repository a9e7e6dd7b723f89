pub mod context;
pub mod estimate;
pub mod executors;
pub mod prompt_expert;
pub mod results;
pub mod roster_file;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::scans::progress::ProgressEmitter;
use crate::scans::{Phase, SubjectContext};

/// Fixed input every expert receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertInput {
    pub subject_id: String,
    pub context: SubjectContext,
}

/// One named, independently schedulable analysis unit.
///
/// `Ok(false)` is an expected domain failure. `Err` and panics are
/// tolerated too; the task runner turns all of them into a failed
/// checkpoint. Long-running work should watch `cancel` and return early
/// once it fires.
#[async_trait]
pub trait Expert: Send + Sync {
    fn name(&self) -> &str;
    fn phase(&self) -> Phase;

    /// Overrides the runner's default per-task timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(
        &self,
        input: &ExpertInput,
        emit: &ProgressEmitter,
        cancel: CancellationToken,
    ) -> Result<bool>;
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster has no experts")]
    Empty,

    #[error("duplicate expert name: {0}")]
    DuplicateName(String),

    #[error("expert {name} declares phase {phase}, expected parallel_analysis or sequential_analysis")]
    InvalidPhase { name: String, phase: Phase },

    #[error("expert name must not be empty")]
    EmptyName,
}

/// The full, ordered set of experts for a scan. Declaration order is the
/// execution order of the sequential phase and the reporting order of
/// run outcomes.
#[derive(Clone)]
pub struct Roster {
    experts: Vec<Arc<dyn Expert>>,
}

impl Roster {
    pub fn new(experts: Vec<Arc<dyn Expert>>) -> Result<Self, RosterError> {
        if experts.is_empty() {
            return Err(RosterError::Empty);
        }
        let mut seen = HashSet::new();
        for expert in &experts {
            let name = expert.name();
            if name.trim().is_empty() {
                return Err(RosterError::EmptyName);
            }
            if !seen.insert(name.to_string()) {
                return Err(RosterError::DuplicateName(name.to_string()));
            }
            if !expert.phase().is_analysis() {
                return Err(RosterError::InvalidPhase {
                    name: name.to_string(),
                    phase: expert.phase(),
                });
            }
        }
        Ok(Self { experts })
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.experts.iter().map(|e| e.name())
    }

    pub fn in_phase(&self, phase: Phase) -> Vec<Arc<dyn Expert>> {
        self.experts
            .iter()
            .filter(|e| e.phase() == phase)
            .cloned()
            .collect()
    }

    pub fn parallel(&self) -> Vec<Arc<dyn Expert>> {
        self.in_phase(Phase::ParallelAnalysis)
    }

    pub fn sequential(&self) -> Vec<Arc<dyn Expert>> {
        self.in_phase(Phase::SequentialAnalysis)
    }
}
