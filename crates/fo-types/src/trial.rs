//! Trial identity, lifecycle status and per-trial bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::pool::TrialOutput;

/// Caller-assigned trial identity. Unique for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrialId {
    Number(u64),
    Name(String),
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialId::Number(n) => write!(f, "{n}"),
            TrialId::Name(name) => f.write_str(name),
        }
    }
}

impl From<u64> for TrialId {
    fn from(n: u64) -> Self {
        TrialId::Number(n)
    }
}

impl From<&str> for TrialId {
    fn from(name: &str) -> Self {
        TrialId::Name(name.to_string())
    }
}

impl From<String> for TrialId {
    fn from(name: String) -> Self {
        TrialId::Name(name)
    }
}

/// Opaque identifier handed back by the worker pool at submission time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for Handle {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle state of a trial.
///
/// The forward path is `Queued -> Running -> Finishing -> Completed -> Processed`.
/// `SubmitFailed` is only ever assigned at submission time. `Processed` and
/// `SubmitFailed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrialStatus {
    SubmitFailed,
    Queued,
    Running,
    Finishing,
    Completed,
    Processed,
}

impl TrialStatus {
    fn rank(self) -> u8 {
        match self {
            TrialStatus::SubmitFailed => 0,
            TrialStatus::Queued => 1,
            TrialStatus::Running => 2,
            TrialStatus::Finishing => 3,
            TrialStatus::Completed => 4,
            TrialStatus::Processed => 5,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(self, next: TrialStatus) -> bool {
        if self.is_terminal() || next == TrialStatus::SubmitFailed {
            return false;
        }
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TrialStatus::Processed | TrialStatus::SubmitFailed)
    }

    /// Still owned by the pool: queued, running or finishing.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TrialStatus::Queued | TrialStatus::Running | TrialStatus::Finishing
        )
    }

    /// Anything the run still has to wait for, including undrained results.
    pub fn is_outstanding(self) -> bool {
        self.is_in_flight() || self == TrialStatus::Completed
    }

    /// Map a status string pushed by an executor onto a state. Only the
    /// courtesy states are accepted; completion must come from the pool.
    pub fn from_advisory(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" => Some(TrialStatus::Running),
            "finishing" => Some(TrialStatus::Finishing),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialStatus::SubmitFailed => "submit-failed",
            TrialStatus::Queued => "queued",
            TrialStatus::Running => "running",
            TrialStatus::Finishing => "finishing",
            TrialStatus::Completed => "completed",
            TrialStatus::Processed => "processed",
        }
    }

    pub const ALL: [TrialStatus; 6] = [
        TrialStatus::SubmitFailed,
        TrialStatus::Queued,
        TrialStatus::Running,
        TrialStatus::Finishing,
        TrialStatus::Completed,
        TrialStatus::Processed,
    ];
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of work submitted to the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    /// Pool handle; `None` when submission failed.
    pub handle: Option<Handle>,
    pub payload: serde_json::Value,
    pub status: TrialStatus,
    pub result: Option<serde_json::Value>,
    /// Pid of the worker that produced the result. Diagnostic only.
    pub worker_pid: Option<u32>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Submission error or result-handler error, if any.
    pub error: Option<String>,
}

impl Trial {
    pub fn queued(id: TrialId, payload: serde_json::Value, handle: Handle) -> Self {
        Self {
            id,
            handle: Some(handle),
            payload,
            status: TrialStatus::Queued,
            result: None,
            worker_pid: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processed_at: None,
            error: None,
        }
    }

    pub fn submit_failed(id: TrialId, payload: serde_json::Value, error: String) -> Self {
        Self {
            id,
            handle: None,
            payload,
            status: TrialStatus::SubmitFailed,
            result: None,
            worker_pid: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processed_at: None,
            error: Some(error),
        }
    }

    /// Move forward to `next`. Returns `false` and leaves the trial untouched
    /// when the move would not be forward.
    pub fn advance(&mut self, next: TrialStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }

        let now = Utc::now();
        match next {
            TrialStatus::Running | TrialStatus::Finishing => {
                self.started_at.get_or_insert(now);
            }
            TrialStatus::Completed => {
                self.started_at.get_or_insert(now);
                self.completed_at = Some(now);
            }
            TrialStatus::Processed => {
                self.processed_at = Some(now);
            }
            TrialStatus::Queued | TrialStatus::SubmitFailed => {}
        }
        self.status = next;
        true
    }

    /// Store the fetched output. The result is set at most once; a second
    /// call is ignored and returns `false`.
    pub fn record_result(&mut self, output: TrialOutput) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(output.value);
        if output.worker_pid.is_some() {
            self.worker_pid = output.worker_pid;
        }
        true
    }

    /// Mark the trial processed, keeping the handler error if one occurred.
    pub fn mark_processed(&mut self, handler_error: Option<String>) -> bool {
        if !self.advance(TrialStatus::Processed) {
            return false;
        }
        if handler_error.is_some() {
            self.error = handler_error;
        }
        true
    }

    pub fn is_outstanding(&self) -> bool {
        self.status.is_outstanding()
    }
}
