//! Reconciliation of pool-reported state into the registry.

use fo_types::{
    AdvisoryReceiver, Handle, PollStage, PollTransientError, QueueClient, QueueSnapshot,
    TrialStatus,
};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

use crate::registry::{TrialRegistry, Transition};

type Observed = (QueueSnapshot, HashSet<Handle>, HashSet<Handle>);

/// What one successful reconciliation pass changed.
#[derive(Debug, Clone)]
pub struct PollSummary {
    pub snapshot: QueueSnapshot,
    /// Trials newly observed running.
    pub started: usize,
    /// Trials newly observed completed.
    pub completed: usize,
    /// Advisory updates that advanced a trial.
    pub advisory_applied: usize,
}

impl PollSummary {
    pub fn progressed(&self) -> bool {
        self.started + self.completed + self.advisory_applied > 0
    }
}

/// Runs reconciliation passes and tracks consecutive failures.
#[derive(Debug, Default)]
pub struct PollLoop {
    advisory: Option<AdvisoryReceiver>,
    last_snapshot: Option<QueueSnapshot>,
    consecutive_failures: u32,
}

impl PollLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_advisory(mut self, receiver: AdvisoryReceiver) -> Self {
        self.set_advisory(receiver);
        self
    }

    /// Attach an advisory receiver, keeping the snapshot and failure count.
    pub fn set_advisory(&mut self, receiver: AdvisoryReceiver) {
        self.advisory = Some(receiver);
    }

    /// Latest snapshot from a successful pass.
    pub fn last_snapshot(&self) -> Option<&QueueSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// One reconciliation pass. All three pool queries must succeed before
    /// anything is applied, so a failed pass leaves the registry untouched.
    pub async fn poll<C>(
        &mut self,
        client: &C,
        registry: &mut TrialRegistry,
    ) -> Result<PollSummary, PollTransientError>
    where
        C: QueueClient + ?Sized,
    {
        let observed = Self::query(client).await;
        let (snapshot, running, completed) = match observed {
            Ok(observed) => observed,
            Err(err) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %err,
                    consecutive_failures = self.consecutive_failures,
                    "poll pass failed"
                );
                return Err(err);
            }
        };
        self.consecutive_failures = 0;

        let mut summary = PollSummary {
            snapshot: snapshot.clone(),
            started: 0,
            completed: 0,
            advisory_applied: 0,
        };

        // a handle in both sets is completed
        for handle in running.difference(&completed) {
            match registry.advance(handle, TrialStatus::Running) {
                Transition::Advanced { .. } => summary.started += 1,
                Transition::Unknown => debug!(handle = %handle, "ignoring running handle from another run"),
                _ => {}
            }
        }

        for handle in &completed {
            match registry.advance(handle, TrialStatus::Completed) {
                Transition::Advanced { .. } => summary.completed += 1,
                Transition::Unknown => debug!(handle = %handle, "ignoring completed handle from another run"),
                _ => {}
            }
        }

        if let Some(receiver) = &self.advisory {
            for update in receiver.drain() {
                let Some(status) = TrialStatus::from_advisory(&update.status) else {
                    debug!(handle = %update.handle, status = %update.status, "ignoring unrecognised advisory status");
                    continue;
                };
                if registry.advance(&update.handle, status).advanced() {
                    summary.advisory_applied += 1;
                }
            }
        }

        trace!(
            queued = snapshot.queued,
            running = snapshot.running,
            completed = snapshot.completed,
            unassigned = snapshot.unassigned,
            started = summary.started,
            newly_completed = summary.completed,
            "poll pass reconciled"
        );
        self.last_snapshot = Some(snapshot);
        Ok(summary)
    }

    async fn query<C>(client: &C) -> Result<Observed, PollTransientError>
    where
        C: QueueClient + ?Sized,
    {
        let snapshot = client
            .snapshot()
            .await
            .map_err(|e| PollTransientError::new(PollStage::Snapshot, e))?;
        let running = client
            .running_handles()
            .await
            .map_err(|e| PollTransientError::new(PollStage::RunningHandles, e))?;
        let completed = client
            .completed_handles()
            .await
            .map_err(|e| PollTransientError::new(PollStage::CompletedHandles, e))?;
        Ok((snapshot, running, completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fo_types::{advisory_channel, PoolResult, Trial, TrialId, TrialOutput};
    use serde_json::json;
    use std::collections::HashMap;

    /// Reports fixed handle sets, for exercising reconciliation rules.
    struct FixedPool {
        running: Vec<&'static str>,
        completed: Vec<&'static str>,
    }

    #[async_trait]
    impl QueueClient for FixedPool {
        async fn submit(&self, _payload: &serde_json::Value) -> PoolResult<Handle> {
            unimplemented!("not used by poll tests")
        }

        async fn snapshot(&self) -> PoolResult<QueueSnapshot> {
            Ok(QueueSnapshot::new(0, self.running.len(), self.completed.len(), 0))
        }

        async fn running_handles(&self) -> PoolResult<HashSet<Handle>> {
            Ok(self.running.iter().map(|h| Handle::new(*h)).collect())
        }

        async fn completed_handles(&self) -> PoolResult<HashSet<Handle>> {
            Ok(self.completed.iter().map(|h| Handle::new(*h)).collect())
        }

        async fn fetch_and_purge(&self, _handles: &[Handle]) -> PoolResult<HashMap<Handle, TrialOutput>> {
            unimplemented!("not used by poll tests")
        }

        async fn worker_count(&self) -> PoolResult<usize> {
            Ok(1)
        }
    }

    fn registry(handles: &[&str]) -> TrialRegistry {
        let mut registry = TrialRegistry::new();
        for (i, handle) in handles.iter().enumerate() {
            registry
                .insert(Trial::queued(
                    TrialId::from(i as u64 + 1),
                    json!(null),
                    Handle::new(*handle),
                ))
                .unwrap();
        }
        registry
    }

    fn status(registry: &TrialRegistry, handle: &str) -> TrialStatus {
        registry.get_by_handle(&Handle::new(handle)).unwrap().status
    }

    #[tokio::test]
    async fn test_running_and_completed_applied() {
        let pool = FixedPool {
            running: vec!["a", "foreign"],
            completed: vec!["b"],
        };
        let mut registry = registry(&["a", "b", "c"]);
        let mut poller = PollLoop::new();

        let summary = poller.poll(&pool, &mut registry).await.unwrap();
        assert_eq!(summary.started, 1);
        assert_eq!(summary.completed, 1);
        assert!(summary.progressed());
        assert_eq!(status(&registry, "a"), TrialStatus::Running);
        assert_eq!(status(&registry, "b"), TrialStatus::Completed);
        assert_eq!(status(&registry, "c"), TrialStatus::Queued);
        assert!(poller.last_snapshot().is_some());

        let again = poller.poll(&pool, &mut registry).await.unwrap();
        assert!(!again.progressed());
    }

    #[tokio::test]
    async fn test_completed_wins_over_running() {
        let pool = FixedPool {
            running: vec!["a"],
            completed: vec!["a"],
        };
        let mut registry = registry(&["a"]);
        PollLoop::new().poll(&pool, &mut registry).await.unwrap();
        assert_eq!(status(&registry, "a"), TrialStatus::Completed);
    }

    #[tokio::test]
    async fn test_stale_running_report_does_not_regress() {
        let mut registry = registry(&["a"]);
        let mut poller = PollLoop::new();

        let done = FixedPool {
            running: vec![],
            completed: vec!["a"],
        };
        poller.poll(&done, &mut registry).await.unwrap();

        let stale = FixedPool {
            running: vec!["a"],
            completed: vec![],
        };
        let summary = poller.poll(&stale, &mut registry).await.unwrap();
        assert_eq!(summary.started, 0);
        assert_eq!(status(&registry, "a"), TrialStatus::Completed);
    }

    #[tokio::test]
    async fn test_advisory_merge_never_regresses() {
        let (publisher, receiver) = advisory_channel();
        let pool = FixedPool {
            running: vec!["a"],
            completed: vec!["b"],
        };
        let mut registry = registry(&["a", "b", "c"]);
        let mut poller = PollLoop::new().with_advisory(receiver);

        publisher.publish(Handle::new("a"), "finishing");
        publisher.publish(Handle::new("b"), "running");
        publisher.publish(Handle::new("c"), "exploded");
        publisher.publish(Handle::new("zzz"), "running");

        let summary = poller.poll(&pool, &mut registry).await.unwrap();
        assert_eq!(summary.advisory_applied, 1);
        assert_eq!(status(&registry, "a"), TrialStatus::Finishing);
        assert_eq!(status(&registry, "b"), TrialStatus::Completed);
        assert_eq!(status(&registry, "c"), TrialStatus::Queued);
    }

    #[tokio::test]
    async fn test_advisory_set_after_first_pass() {
        let (publisher, receiver) = advisory_channel();
        let pool = FixedPool {
            running: vec!["a"],
            completed: vec!["b"],
        };
        let mut registry = registry(&["a", "b"]);
        let mut poller = PollLoop::new();
        poller.poll(&pool, &mut registry).await.unwrap();
        let before = poller.last_snapshot().cloned();

        poller.set_advisory(receiver);
        assert_eq!(poller.last_snapshot().cloned(), before);

        publisher.publish(Handle::new("a"), "finishing");
        let summary = poller.poll(&pool, &mut registry).await.unwrap();
        assert_eq!(summary.advisory_applied, 1);
        assert_eq!(status(&registry, "a"), TrialStatus::Finishing);
    }

    #[tokio::test]
    async fn test_failed_pass_leaves_registry_untouched() {
        let pool = fo_pool::SimulatedPool::scripted(Default::default(), |_, _| {
            fo_pool::TrialScript::complete(0, 0)
        });
        let handle = pool.submit(&json!(null)).await.unwrap();
        let mut registry = TrialRegistry::new();
        registry
            .insert(Trial::queued(TrialId::from(1), json!(null), handle.clone()))
            .unwrap();
        let mut poller = PollLoop::new();

        pool.fail_next_queries(2);
        assert!(poller.poll(&pool, &mut registry).await.is_err());
        let err = poller.poll(&pool, &mut registry).await.unwrap_err();
        assert_eq!(err.stage, PollStage::Snapshot);
        assert_eq!(poller.consecutive_failures(), 2);
        assert!(poller.last_snapshot().is_none());

        poller.poll(&pool, &mut registry).await.unwrap();
        assert_eq!(poller.consecutive_failures(), 0);
        assert_eq!(
            registry.get_by_handle(&handle).unwrap().status,
            TrialStatus::Completed
        );
    }
}
