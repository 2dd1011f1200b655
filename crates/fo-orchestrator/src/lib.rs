//! # fo-orchestrator
//!
//! Distributed trial orchestration for Fanout.
//!
//! Submits independent trials to a remote worker pool, reconciles the pool's
//! eventually-consistent status reports into a per-run registry, drains each
//! completed result exactly once through a caller-supplied handler, and
//! decides when the run is over.

mod cancel;
mod config;
mod drain;
mod orchestrator;
mod poll;
mod registry;
mod report;
mod selection;
mod submitter;

pub use cancel::CancelHandle;
pub use config::OrchestratorConfig;
pub use drain::{DrainOutcome, ResultDrainer, ResultHandler};
pub use orchestrator::{termination_predicate, Orchestrator};
pub use poll::{PollLoop, PollSummary};
pub use registry::{StatusCounts, TrialRegistry, Transition};
pub use report::{Diagnostic, RunOutcome, RunReport};
pub use selection::{SelectionError, TrialSelection};
pub use submitter::Submitter;
