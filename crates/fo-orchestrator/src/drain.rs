//! Exactly-once draining of completed results.

use fo_types::{DrainError, HandlerError, QueueClient, Trial, TrialId, TrialStatus};
use std::fmt::Display;
use tracing::{debug, info, warn};

use crate::registry::TrialRegistry;
use crate::report::Diagnostic;

/// Consumes each trial's result once it has been fetched.
///
/// Called synchronously from the orchestrator loop; a slow handler delays
/// the next poll. Returning `Err` records the message on the trial, which is
/// still marked processed.
pub trait ResultHandler: Send {
    fn handle(&mut self, trial: &Trial) -> Result<(), String>;
}

impl<F, E> ResultHandler for F
where
    F: FnMut(&Trial) -> Result<(), E> + Send,
    E: Display,
{
    fn handle(&mut self, trial: &Trial) -> Result<(), String> {
        self(trial).map_err(|e| e.to_string())
    }
}

/// Result of one [`ResultDrainer::drain_once`] call.
#[derive(Debug, Clone, Default)]
pub struct DrainOutcome {
    /// Trials marked processed by this call.
    pub processed: Vec<Trial>,
    /// Completed trials the pool returned no result for; retried next call.
    pub missing: Vec<TrialId>,
    pub diagnostics: Vec<Diagnostic>,
    /// The fetch-and-purge call itself failed.
    pub fetch_failed: bool,
}

impl DrainOutcome {
    pub fn is_empty(&self) -> bool {
        self.processed.is_empty() && self.missing.is_empty() && self.diagnostics.is_empty()
    }
}

/// Fetches, purges and hands off completed results.
pub struct ResultDrainer<H> {
    handler: H,
}

impl<H: ResultHandler> ResultDrainer<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Drain every trial currently `completed` with a single
    /// fetch-and-purge call. No pool call is made when nothing is completed.
    /// Failures are reported as diagnostics, never returned.
    pub async fn drain_once<C>(&mut self, client: &C, registry: &mut TrialRegistry) -> DrainOutcome
    where
        C: QueueClient + ?Sized,
    {
        let mut outcome = DrainOutcome::default();
        let batch = registry.handles_in(TrialStatus::Completed);
        if batch.is_empty() {
            return outcome;
        }

        debug!(batch = batch.len(), "fetching completed results");
        let mut outputs = match client.fetch_and_purge(&batch).await {
            Ok(outputs) => outputs,
            Err(source) => {
                let error = DrainError {
                    batch: batch.len(),
                    source,
                };
                warn!(error = %error, "drain failed; batch stays completed");
                outcome.fetch_failed = true;
                outcome.diagnostics.push(Diagnostic::Drain { error, attempts: 1 });
                return outcome;
            }
        };

        for handle in &batch {
            let Some(output) = outputs.remove(handle) else {
                if let Some(trial) = registry.get_by_handle(handle) {
                    warn!(trial = %trial.id, handle = %handle, "no result returned; will retry");
                    outcome.missing.push(trial.id.clone());
                }
                continue;
            };
            let Some(trial) = registry.get_mut_by_handle(handle) else {
                continue;
            };

            trial.record_result(output);
            let handler_error = match self.handler.handle(trial) {
                Ok(()) => None,
                Err(message) => {
                    warn!(trial = %trial.id, error = %message, "result handler failed");
                    outcome.diagnostics.push(Diagnostic::Handler(HandlerError {
                        trial: trial.id.clone(),
                        message: message.clone(),
                    }));
                    Some(message)
                }
            };
            trial.mark_processed(handler_error);
            outcome.processed.push(trial.clone());
        }

        for handle in outputs.keys() {
            warn!(handle = %handle, "discarding result that was not requested");
        }

        if !outcome.processed.is_empty() {
            info!(
                processed = outcome.processed.len(),
                missing = outcome.missing.len(),
                "drained results"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fo_pool::{SimulatedPool, SimulatedPoolConfig, TrialScript};
    use fo_types::{Handle, TrialOutput};
    use serde_json::json;

    /// Submit `n` trials that finish on the first snapshot, take that
    /// snapshot and mark them completed in a fresh registry.
    async fn completed_run(n: u64) -> (SimulatedPool, TrialRegistry) {
        let pool = SimulatedPool::scripted(
            SimulatedPoolConfig {
                workers: 16,
                ..Default::default()
            },
            |i, _| TrialScript::complete(0, 0).with_output(json!(i * 10)),
        );
        let mut registry = TrialRegistry::new();
        for i in 1..=n {
            let handle = pool.submit(&json!(i)).await.unwrap();
            registry
                .insert(Trial::queued(TrialId::from(i), json!(i), handle))
                .unwrap();
        }
        pool.snapshot().await.unwrap();
        for handle in pool.completed_handles().await.unwrap() {
            registry.advance(&handle, TrialStatus::Completed);
        }
        (pool, registry)
    }

    fn ok_handler(_: &Trial) -> Result<(), String> {
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_completed_means_no_pool_call() {
        let pool = SimulatedPool::with_defaults();
        let mut registry = TrialRegistry::new();
        let mut drainer = ResultDrainer::new(ok_handler);

        let outcome = drainer.drain_once(&pool, &mut registry).await;
        assert!(outcome.is_empty());
        assert!(pool.fetch_log().is_empty());
    }

    #[tokio::test]
    async fn test_drain_processes_batch_once() {
        let (pool, mut registry) = completed_run(3).await;
        let mut seen = Vec::new();
        let mut drainer = ResultDrainer::new(|trial: &Trial| {
            seen.push(trial.id.clone());
            Ok::<_, String>(())
        });

        let outcome = drainer.drain_once(&pool, &mut registry).await;
        assert_eq!(outcome.processed.len(), 3);
        assert_eq!(pool.fetch_log().len(), 1);
        assert_eq!(pool.fetch_log()[0].len(), 3);

        let trial = registry.get(&TrialId::from(2)).unwrap();
        assert_eq!(trial.status, TrialStatus::Processed);
        assert_eq!(trial.result, Some(json!(20)));
        assert!(trial.worker_pid.is_some());

        // a second drain has nothing to fetch
        let again = drainer.drain_once(&pool, &mut registry).await;
        assert!(again.is_empty());
        assert_eq!(pool.fetch_log().len(), 1);
        drop(drainer);
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_result_stays_completed_and_is_retried() {
        let (pool, mut registry) = completed_run(3).await;
        let withheld = registry.get(&TrialId::from(3)).unwrap().handle.clone().unwrap();
        pool.withhold_result(&withheld, 1);
        let mut drainer = ResultDrainer::new(ok_handler);

        let first = drainer.drain_once(&pool, &mut registry).await;
        assert_eq!(first.processed.len(), 2);
        assert_eq!(first.missing, vec![TrialId::from(3)]);
        assert!(first.diagnostics.is_empty());
        assert_eq!(
            registry.get(&TrialId::from(3)).unwrap().status,
            TrialStatus::Completed
        );

        let second = drainer.drain_once(&pool, &mut registry).await;
        assert_eq!(second.processed.len(), 1);
        assert_eq!(pool.fetch_log()[1], vec![withheld]);
        assert_eq!(registry.count(TrialStatus::Processed), 3);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_batch_completed() {
        let (pool, mut registry) = completed_run(2).await;
        pool.fail_next_fetches(1);
        let mut drainer = ResultDrainer::new(ok_handler);

        let failed = drainer.drain_once(&pool, &mut registry).await;
        assert!(failed.processed.is_empty());
        assert!(matches!(
            failed.diagnostics.as_slice(),
            [Diagnostic::Drain {
                error: DrainError { batch: 2, .. },
                attempts: 1
            }]
        ));
        assert!(failed.fetch_failed);
        assert_eq!(registry.count(TrialStatus::Completed), 2);

        let retried = drainer.drain_once(&pool, &mut registry).await;
        assert_eq!(retried.processed.len(), 2);
        assert!(!retried.fetch_failed);
    }

    #[tokio::test]
    async fn test_handler_error_still_processed() {
        let (pool, mut registry) = completed_run(5).await;
        let mut drainer = ResultDrainer::new(|trial: &Trial| {
            if trial.id == TrialId::from(4) {
                Err("cannot parse result")
            } else {
                Ok(())
            }
        });

        let outcome = drainer.drain_once(&pool, &mut registry).await;
        assert_eq!(outcome.processed.len(), 5);
        assert_eq!(registry.count(TrialStatus::Processed), 5);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(
            registry.get(&TrialId::from(4)).unwrap().error.as_deref(),
            Some("cannot parse result")
        );
        assert!(registry.get(&TrialId::from(1)).unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_unrequested_results_discarded() {
        struct ChattyPool(SimulatedPool);

        #[async_trait::async_trait]
        impl QueueClient for ChattyPool {
            async fn submit(&self, payload: &serde_json::Value) -> fo_types::PoolResult<Handle> {
                self.0.submit(payload).await
            }
            async fn snapshot(&self) -> fo_types::PoolResult<fo_types::QueueSnapshot> {
                self.0.snapshot().await
            }
            async fn running_handles(&self) -> fo_types::PoolResult<std::collections::HashSet<Handle>> {
                self.0.running_handles().await
            }
            async fn completed_handles(&self) -> fo_types::PoolResult<std::collections::HashSet<Handle>> {
                self.0.completed_handles().await
            }
            async fn fetch_and_purge(
                &self,
                handles: &[Handle],
            ) -> fo_types::PoolResult<std::collections::HashMap<Handle, TrialOutput>> {
                let mut outputs = self.0.fetch_and_purge(handles).await?;
                outputs.insert(Handle::new("stranger"), TrialOutput::new(json!("?")));
                Ok(outputs)
            }
            async fn worker_count(&self) -> fo_types::PoolResult<usize> {
                self.0.worker_count().await
            }
        }

        let (pool, mut registry) = completed_run(1).await;
        let pool = ChattyPool(pool);
        let mut drainer = ResultDrainer::new(ok_handler);

        let outcome = drainer.drain_once(&pool, &mut registry).await;
        assert_eq!(outcome.processed.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
