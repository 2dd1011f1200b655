//! Worker pool contract consumed by the orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::PoolResult;
use crate::trial::Handle;

/// Point-in-time aggregate counts reported by the worker pool.
///
/// Not authoritative per-trial truth: it can lag or lead the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub unassigned: usize,
    pub taken_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn new(queued: usize, running: usize, completed: usize, unassigned: usize) -> Self {
        Self {
            queued,
            running,
            completed,
            unassigned,
            taken_at: Utc::now(),
        }
    }

    /// The pool believes it has nothing left to execute.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.running == 0 && self.unassigned == 0
    }

    /// Work items the pool still has to execute.
    pub fn pending(&self) -> usize {
        self.queued + self.running + self.unassigned
    }
}

/// Output of a finished trial as returned by fetch-and-purge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutput {
    pub value: serde_json::Value,
    pub worker_pid: Option<u32>,
}

impl TrialOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            worker_pid: None,
        }
    }

    pub fn with_worker_pid(mut self, pid: u32) -> Self {
        self.worker_pid = Some(pid);
        self
    }
}

/// Adapter to a remote pool of worker processes.
///
/// The orchestrator awaits every call to completion before issuing the next
/// one. Implementations may block on network I/O inside these calls.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Submit a payload for asynchronous execution. Returns immediately with
    /// a handle for later queries.
    async fn submit(&self, payload: &serde_json::Value) -> PoolResult<Handle>;

    /// Aggregate queue counts across all known workers.
    async fn snapshot(&self) -> PoolResult<QueueSnapshot>;

    /// Handles currently executing on some worker.
    async fn running_handles(&self) -> PoolResult<HashSet<Handle>>;

    /// Handles whose work finished but whose results are not yet purged.
    async fn completed_handles(&self) -> PoolResult<HashSet<Handle>>;

    /// Retrieve and remove the results for `handles` in one step, so that a
    /// later [`QueueClient::completed_handles`] no longer reports them.
    /// Handles without a result are simply absent from the returned map.
    async fn fetch_and_purge(&self, handles: &[Handle]) -> PoolResult<HashMap<Handle, TrialOutput>>;

    /// Number of workers currently registered with the pool.
    async fn worker_count(&self) -> PoolResult<usize>;
}

#[async_trait]
impl<C: QueueClient + ?Sized> QueueClient for Arc<C> {
    async fn submit(&self, payload: &serde_json::Value) -> PoolResult<Handle> {
        (**self).submit(payload).await
    }

    async fn snapshot(&self) -> PoolResult<QueueSnapshot> {
        (**self).snapshot().await
    }

    async fn running_handles(&self) -> PoolResult<HashSet<Handle>> {
        (**self).running_handles().await
    }

    async fn completed_handles(&self) -> PoolResult<HashSet<Handle>> {
        (**self).completed_handles().await
    }

    async fn fetch_and_purge(&self, handles: &[Handle]) -> PoolResult<HashMap<Handle, TrialOutput>> {
        (**self).fetch_and_purge(handles).await
    }

    async fn worker_count(&self) -> PoolResult<usize> {
        (**self).worker_count().await
    }
}
