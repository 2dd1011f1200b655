//! Run outcome and diagnostics.

use fo_types::{DrainError, HandlerError, PollTransientError, QueueSnapshot, Trial, TrialId};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::registry::StatusCounts;

/// Non-fatal problems collected during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    Poll(PollTransientError),
    /// `attempts` counts consecutive identical failures folded into this entry.
    Drain { error: DrainError, attempts: u32 },
    Handler(HandlerError),
    /// The pool went idle while these trials were still outstanding.
    Stalled { trials: Vec<TrialId> },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Poll(e) => write!(f, "{e}"),
            Diagnostic::Drain { error, attempts: 1 } => write!(f, "{error}"),
            Diagnostic::Drain { error, attempts } => write!(f, "{error} ({attempts} attempts)"),
            Diagnostic::Handler(e) => write!(f, "{e}"),
            Diagnostic::Stalled { trials } => {
                let ids: Vec<String> = trials.iter().map(ToString::to_string).collect();
                write!(f, "pool idle with trials outstanding: {}", ids.join(","))
            }
        }
    }
}

/// Why the orchestrator loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    /// Every trial reached a terminal state and the pool is idle.
    Finished,
    Cancelled,
    PoolUnreachable,
    Stalled,
    IterationLimit,
}

impl RunOutcome {
    pub fn is_finished(self) -> bool {
        self == RunOutcome::Finished
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunOutcome::Finished => "finished",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::PoolUnreachable => "pool-unreachable",
            RunOutcome::Stalled => "stalled",
            RunOutcome::IterationLimit => "iteration-limit",
        };
        f.write_str(name)
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Registry contents at exit, ordered by trial id.
    pub trials: Vec<Trial>,
    pub diagnostics: Vec<Diagnostic>,
    pub iterations: u64,
    pub last_snapshot: Option<QueueSnapshot>,
}

impl RunReport {
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for trial in &self.trials {
            counts.bump(trial.status);
        }
        counts
    }

    pub fn handler_errors(&self) -> Vec<&HandlerError> {
        self.diagnostics
            .iter()
            .filter_map(|d| match d {
                Diagnostic::Handler(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn trial(&self, id: &TrialId) -> Option<&Trial> {
        self.trials.iter().find(|t| &t.id == id)
    }
}
