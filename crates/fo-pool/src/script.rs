//! Scripted trial behaviour for the simulated pool.

use serde::{Deserialize, Serialize};

/// How a submitted trial behaves once it reaches the simulated pool.
///
/// Durations are counted in pool snapshots ("polls"). A trial first waits
/// `queued_polls` snapshots in a worker queue, then needs a free worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialScript {
    /// Run for `running_polls` snapshots, then publish `output` (or an echo
    /// of the payload when `None`).
    Complete {
        queued_polls: u32,
        running_polls: u32,
        output: Option<serde_json::Value>,
    },
    /// Start running and never finish.
    Stuck { queued_polls: u32 },
    /// Vanish from every pool view once dequeued, as if the worker died.
    Lost { queued_polls: u32 },
}

impl TrialScript {
    pub fn complete(queued_polls: u32, running_polls: u32) -> Self {
        TrialScript::Complete {
            queued_polls,
            running_polls,
            output: None,
        }
    }

    pub fn stuck() -> Self {
        TrialScript::Stuck { queued_polls: 0 }
    }

    pub fn lost() -> Self {
        TrialScript::Lost { queued_polls: 0 }
    }

    /// Replace the output of a `Complete` script. Other scripts never
    /// produce output and are returned unchanged.
    pub fn with_output(self, value: serde_json::Value) -> Self {
        match self {
            TrialScript::Complete {
                queued_polls,
                running_polls,
                ..
            } => TrialScript::Complete {
                queued_polls,
                running_polls,
                output: Some(value),
            },
            other => other,
        }
    }

    pub fn queued_polls(&self) -> u32 {
        match self {
            TrialScript::Complete { queued_polls, .. }
            | TrialScript::Stuck { queued_polls }
            | TrialScript::Lost { queued_polls } => *queued_polls,
        }
    }
}
