//! Per-run trial registry.

use fo_types::{FanoutResult, Handle, OrchestratorError, Trial, TrialId, TrialStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Result of applying an observed status to a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced { from: TrialStatus, to: TrialStatus },
    /// Already in the observed status.
    Unchanged,
    /// The observation would move the trial backwards; ignored.
    Rejected { current: TrialStatus },
    /// The handle belongs to no trial of this run.
    Unknown,
}

impl Transition {
    pub fn advanced(&self) -> bool {
        matches!(self, Transition::Advanced { .. })
    }
}

/// Number of trials per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub submit_failed: usize,
    pub queued: usize,
    pub running: usize,
    pub finishing: usize,
    pub completed: usize,
    pub processed: usize,
}

impl StatusCounts {
    pub fn get(&self, status: TrialStatus) -> usize {
        match status {
            TrialStatus::SubmitFailed => self.submit_failed,
            TrialStatus::Queued => self.queued,
            TrialStatus::Running => self.running,
            TrialStatus::Finishing => self.finishing,
            TrialStatus::Completed => self.completed,
            TrialStatus::Processed => self.processed,
        }
    }

    pub(crate) fn bump(&mut self, status: TrialStatus) {
        let slot = match status {
            TrialStatus::SubmitFailed => &mut self.submit_failed,
            TrialStatus::Queued => &mut self.queued,
            TrialStatus::Running => &mut self.running,
            TrialStatus::Finishing => &mut self.finishing,
            TrialStatus::Completed => &mut self.completed,
            TrialStatus::Processed => &mut self.processed,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        TrialStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Trials the run still waits for.
    pub fn outstanding(&self) -> usize {
        self.queued + self.running + self.finishing + self.completed
    }
}

/// Trials of one run keyed by id, with a handle index for reconciling pool
/// reports. Only the orchestrator's control flow mutates it.
#[derive(Debug, Clone, Default)]
pub struct TrialRegistry {
    trials: BTreeMap<TrialId, Trial>,
    by_handle: HashMap<Handle, TrialId>,
}

impl TrialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn contains(&self, id: &TrialId) -> bool {
        self.trials.contains_key(id)
    }

    pub fn get(&self, id: &TrialId) -> Option<&Trial> {
        self.trials.get(id)
    }

    pub fn get_by_handle(&self, handle: &Handle) -> Option<&Trial> {
        self.by_handle.get(handle).and_then(|id| self.trials.get(id))
    }

    pub(crate) fn get_mut_by_handle(&mut self, handle: &Handle) -> Option<&mut Trial> {
        let id = self.by_handle.get(handle)?;
        self.trials.get_mut(id)
    }

    /// Add a freshly submitted trial. Identities and pool handles are unique
    /// per run; a rejected trial leaves the registry unchanged.
    pub fn insert(&mut self, trial: Trial) -> FanoutResult<()> {
        if self.trials.contains_key(&trial.id) {
            return Err(OrchestratorError::DuplicateTrial {
                trial: trial.id.clone(),
            }
            .into());
        }
        if let Some(owner) = trial.handle.as_ref().and_then(|h| self.by_handle.get(h)) {
            return Err(OrchestratorError::DuplicateHandle {
                handle: trial.handle.as_ref().map(ToString::to_string).unwrap_or_default(),
                owner: owner.clone(),
            }
            .into());
        }
        if let Some(handle) = &trial.handle {
            self.by_handle.insert(handle.clone(), trial.id.clone());
        }
        self.trials.insert(trial.id.clone(), trial);
        Ok(())
    }

    /// Apply an observed status to the trial owning `handle`. Never moves a
    /// trial backwards.
    pub fn advance(&mut self, handle: &Handle, status: TrialStatus) -> Transition {
        let Some(trial) = self.get_mut_by_handle(handle) else {
            return Transition::Unknown;
        };

        let from = trial.status;
        if from == status {
            return Transition::Unchanged;
        }
        if trial.advance(status) {
            debug!(trial = %trial.id, %from, to = %status, "trial advanced");
            Transition::Advanced { from, to: status }
        } else {
            debug!(trial = %trial.id, current = %from, observed = %status, "ignoring status regression");
            Transition::Rejected { current: from }
        }
    }

    /// Handles of all trials currently in `status`.
    pub fn handles_in(&self, status: TrialStatus) -> Vec<Handle> {
        self.trials
            .values()
            .filter(|t| t.status == status)
            .filter_map(|t| t.handle.clone())
            .collect()
    }

    pub fn ids_in(&self, status: TrialStatus) -> Vec<TrialId> {
        self.trials
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.values().filter(|t| t.status == status).count()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for trial in self.trials.values() {
            counts.bump(trial.status);
        }
        counts
    }

    /// Trials in queued, running, finishing or completed.
    pub fn outstanding_count(&self) -> usize {
        self.trials.values().filter(|t| t.is_outstanding()).count()
    }

    /// Ids of trials the pool still owns (queued, running, finishing).
    pub fn in_flight(&self) -> Vec<TrialId> {
        self.trials
            .values()
            .filter(|t| t.status.is_in_flight())
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials.values()
    }

    /// Copy of every trial, ordered by id.
    pub fn snapshot(&self) -> Vec<Trial> {
        self.trials.values().cloned().collect()
    }
}
