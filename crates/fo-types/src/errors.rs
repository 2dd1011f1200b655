use std::fmt;
use thiserror::Error;

use crate::trial::TrialId;

/// Main error type for the Fanout orchestrator
#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by a worker pool adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool unreachable: {message}")]
    Unreachable { message: String },

    #[error("worker pool saturated: {message}")]
    Saturated { message: String },

    #[error("unknown handle: {handle}")]
    UnknownHandle { handle: String },

    #[error("worker pool internal error: {message}")]
    Internal { message: String },
}

/// Result alias for worker pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// The pool rejected a trial, or could not be reached, at submit time.
/// Recorded on the trial; never aborts the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("submission of trial {trial} failed: {source}")]
pub struct SubmissionError {
    pub trial: TrialId,
    #[source]
    pub source: PoolError,
}

/// Which query of a poll pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStage {
    Snapshot,
    RunningHandles,
    CompletedHandles,
}

impl fmt::Display for PollStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollStage::Snapshot => "snapshot",
            PollStage::RunningHandles => "running-handles",
            PollStage::CompletedHandles => "completed-handles",
        };
        f.write_str(name)
    }
}

/// A poll pass could not complete. The pass is skipped and retried on the
/// next wake-up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("poll pass failed at {stage}: {source}")]
pub struct PollTransientError {
    pub stage: PollStage,
    #[source]
    pub source: PoolError,
}

impl PollTransientError {
    pub fn new(stage: PollStage, source: PoolError) -> Self {
        Self { stage, source }
    }
}

/// Fetch-and-purge failed for a whole batch; the batch stays completed and is
/// retried on the next drain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fetch-and-purge of {batch} results failed: {source}")]
pub struct DrainError {
    pub batch: usize,
    #[source]
    pub source: PoolError,
}

/// The caller's result handler failed for one trial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("result handler failed for trial {trial}: {message}")]
pub struct HandlerError {
    pub trial: TrialId,
    pub message: String,
}

/// Errors that stop an orchestrator call before the loop starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("trial {trial} was already submitted in this run")]
    DuplicateTrial { trial: TrialId },

    #[error("pool handle {handle} already belongs to trial {owner}")]
    DuplicateHandle { handle: String, owner: TrialId },

    #[error("no workers registered after {tries} tries")]
    NoWorkers { tries: u32 },

    #[error("cancelled before the run started")]
    Cancelled,
}

/// Result type alias for Fanout operations
pub type FanoutResult<T> = Result<T, FanoutError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::FanoutError::Config(format!($($arg)*))
    };
}
