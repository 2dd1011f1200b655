//! # fo-pool
//!
//! In-process worker pool for sandbox runs and tests of the Fanout
//! orchestrator. Trials follow scripted lifecycles on a simulated clock that
//! advances once per pool snapshot, and faults can be injected to exercise the
//! orchestrator's failure handling without a real cluster.

mod script;
mod simulated;

pub use script::TrialScript;
pub use simulated::{SimulatedPool, SimulatedPoolConfig};
