//! The orchestrator loop: poll, drain, decide, sleep.

use fo_types::{
    AdvisoryReceiver, FanoutResult, OrchestratorError, QueueClient, QueueSnapshot, Trial, TrialId,
    TrialStatus,
};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelHandle;
use crate::config::OrchestratorConfig;
use crate::drain::{ResultDrainer, ResultHandler};
use crate::poll::PollLoop;
use crate::registry::TrialRegistry;
use crate::report::{Diagnostic, RunOutcome, RunReport};
use crate::selection::TrialSelection;
use crate::submitter::Submitter;

/// True when the pool reports nothing left to execute and no trial of this
/// run is still queued, running, finishing or waiting to be drained.
pub fn termination_predicate(snapshot: &QueueSnapshot, registry: &TrialRegistry) -> bool {
    snapshot.is_idle() && registry.outstanding_count() == 0
}

/// Drives one run of trials against a worker pool.
///
/// Owns the registry; every mutation happens through `&mut self`, so pool
/// calls and registry updates are strictly sequential.
pub struct Orchestrator<C, H> {
    client: C,
    config: OrchestratorConfig,
    registry: TrialRegistry,
    poller: PollLoop,
    drainer: ResultDrainer<H>,
    cancel: CancelHandle,
    diagnostics: Vec<Diagnostic>,
    iterations: u64,
    stalled_iterations: u32,
    drain_failures: u32,
}

impl<C, H> Orchestrator<C, H>
where
    C: QueueClient,
    H: ResultHandler,
{
    pub fn new(client: C, handler: H, config: OrchestratorConfig) -> FanoutResult<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            registry: TrialRegistry::new(),
            poller: PollLoop::new(),
            drainer: ResultDrainer::new(handler),
            cancel: CancelHandle::new(),
            diagnostics: Vec::new(),
            iterations: 0,
            stalled_iterations: 0,
            drain_failures: 0,
        })
    }

    /// Merge executor-pushed status updates on every poll pass.
    pub fn with_advisory(mut self, receiver: AdvisoryReceiver) -> Self {
        self.poller.set_advisory(receiver);
        self
    }

    /// Share an existing cancellation flag.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &TrialRegistry {
        &self.registry
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Wait until the pool reports at least one worker. Pool errors count as
    /// a failed try.
    pub async fn wait_for_workers(&self) -> FanoutResult<usize> {
        let tries = self.config.startup_wait_tries;
        for attempt in 1..=tries {
            if self.cancel.is_cancelled() {
                info!(attempt, "startup wait cancelled");
                return Err(OrchestratorError::Cancelled.into());
            }
            match self.client.worker_count().await {
                Ok(workers) if workers > 0 => {
                    info!(workers, "worker pool ready");
                    return Ok(workers);
                }
                Ok(_) => debug!(attempt, tries, "no workers registered yet"),
                Err(e) => warn!(attempt, tries, error = %e, "worker count query failed"),
            }

            if attempt < tries && self.cancel.sleep(self.config.startup_wait_interval()).await {
                info!(attempt, "startup wait cancelled");
                return Err(OrchestratorError::Cancelled.into());
            }
        }

        error!(tries, "no workers available");
        Err(OrchestratorError::NoWorkers { tries }.into())
    }

    pub async fn submit_all<F>(&mut self, n: u64, payload_factory: F) -> FanoutResult<Vec<Trial>>
    where
        F: FnMut(u64) -> serde_json::Value,
    {
        Submitter::new(&self.client, &mut self.registry)
            .submit_all(n, payload_factory)
            .await
    }

    pub async fn submit_selected<F>(
        &mut self,
        selection: &TrialSelection,
        trial_count: u64,
        payload_factory: F,
    ) -> FanoutResult<Vec<Trial>>
    where
        F: FnMut(u64) -> serde_json::Value,
    {
        Submitter::new(&self.client, &mut self.registry)
            .submit_selected(selection, trial_count, payload_factory)
            .await
    }

    pub async fn submit_batch<I>(&mut self, trials: I) -> FanoutResult<Vec<Trial>>
    where
        I: IntoIterator<Item = (TrialId, serde_json::Value)>,
    {
        Submitter::new(&self.client, &mut self.registry)
            .submit_batch(trials)
            .await
    }

    /// Wait for workers, submit trials `1..=n` and drive them to the end.
    pub async fn run<F>(&mut self, n: u64, payload_factory: F) -> FanoutResult<RunReport>
    where
        F: FnMut(u64) -> serde_json::Value,
    {
        self.wait_for_workers().await?;
        self.submit_all(n, payload_factory).await?;
        Ok(self.drive().await)
    }

    /// Loop until every submitted trial is processed, or the run is
    /// cancelled, stalls, loses the pool, or hits its iteration cap.
    pub async fn drive(&mut self) -> RunReport {
        info!(
            trials = self.registry.len(),
            poll_interval_ms = self.config.poll_interval_ms,
            "orchestrator loop starting"
        );

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }
            if let Some(limit) = self.config.max_iterations {
                if self.iterations >= limit {
                    warn!(limit, "iteration limit reached");
                    break RunOutcome::IterationLimit;
                }
            }

            self.iterations += 1;
            if let Some(outcome) = self.iterate().await {
                break outcome;
            }
            self.cancel.sleep(self.config.poll_interval()).await;
        };

        let report = self.report(outcome);
        let counts = report.counts();
        info!(
            outcome = %report.outcome,
            iterations = report.iterations,
            processed = counts.processed,
            submit_failed = counts.submit_failed,
            outstanding = counts.outstanding(),
            diagnostics = report.diagnostics.len(),
            "orchestrator loop stopped"
        );
        report
    }

    async fn iterate(&mut self) -> Option<RunOutcome> {
        let summary = match self.poller.poll(&self.client, &mut self.registry).await {
            Ok(summary) => summary,
            Err(err) => {
                self.diagnostics.push(Diagnostic::Poll(err));
                let failures = self.poller.consecutive_failures();
                if failures >= self.config.max_consecutive_failures {
                    error!(failures, "worker pool unreachable; giving up");
                    return Some(RunOutcome::PoolUnreachable);
                }
                return None;
            }
        };

        let drained = self.drainer.drain_once(&self.client, &mut self.registry).await;
        let drained_any = !drained.processed.is_empty();
        for diagnostic in drained.diagnostics {
            self.record(diagnostic);
        }

        if drained.fetch_failed {
            self.drain_failures += 1;
            if self.drain_failures >= self.config.max_consecutive_failures {
                error!(
                    failures = self.drain_failures,
                    completed = self.registry.count(TrialStatus::Completed),
                    "fetch-and-purge keeps failing; giving up"
                );
                return Some(RunOutcome::PoolUnreachable);
            }
        } else {
            self.drain_failures = 0;
        }

        if termination_predicate(&summary.snapshot, &self.registry) {
            info!(iteration = self.iterations, "all trials processed");
            return Some(RunOutcome::Finished);
        }

        let in_flight = self.registry.in_flight();
        if summary.snapshot.is_idle() && !in_flight.is_empty() && !summary.progressed() && !drained_any {
            self.stalled_iterations += 1;
            debug!(
                stalled_iterations = self.stalled_iterations,
                in_flight = in_flight.len(),
                "pool idle with trials in flight"
            );
            if let Some(limit) = self.config.stall_limit {
                if self.stalled_iterations >= limit {
                    error!(
                        trials = in_flight.len(),
                        iterations = self.stalled_iterations,
                        "run stalled; pool no longer knows about outstanding trials"
                    );
                    self.diagnostics.push(Diagnostic::Stalled { trials: in_flight });
                    return Some(RunOutcome::Stalled);
                }
            }
        } else {
            self.stalled_iterations = 0;
        }

        debug!(
            iteration = self.iterations,
            outstanding = self.registry.outstanding_count(),
            pending = summary.snapshot.pending(),
            "iteration complete"
        );
        None
    }

    /// Folds a drain failure identical to the previous diagnostic into it.
    fn record(&mut self, diagnostic: Diagnostic) {
        if let (
            Some(Diagnostic::Drain {
                error: last,
                attempts,
            }),
            Diagnostic::Drain { error, .. },
        ) = (self.diagnostics.last_mut(), &diagnostic)
        {
            if last == error {
                *attempts += 1;
                return;
            }
        }
        self.diagnostics.push(diagnostic);
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        RunReport {
            outcome,
            trials: self.registry.snapshot(),
            diagnostics: self.diagnostics.clone(),
            iterations: self.iterations,
            last_snapshot: self.poller.last_snapshot().cloned(),
        }
    }
}
