//! Trial submission.

use fo_types::{FanoutResult, OrchestratorError, QueueClient, SubmissionError, Trial, TrialId};
use tracing::{debug, info, warn};

use crate::registry::TrialRegistry;
use crate::selection::TrialSelection;

/// Submits trials to the pool and records each one in the registry, as
/// `queued` on success or `submit-failed` when the pool refuses it.
pub struct Submitter<'a, C: QueueClient + ?Sized> {
    client: &'a C,
    registry: &'a mut TrialRegistry,
}

impl<'a, C: QueueClient + ?Sized> Submitter<'a, C> {
    pub fn new(client: &'a C, registry: &'a mut TrialRegistry) -> Self {
        Self { client, registry }
    }

    /// Submit trials `1..=n`, building each payload with `payload_factory`.
    pub async fn submit_all<F>(&mut self, n: u64, mut payload_factory: F) -> FanoutResult<Vec<Trial>>
    where
        F: FnMut(u64) -> serde_json::Value,
    {
        info!(trials = n, "submitting trials");
        self.submit_batch((1..=n).map(|i| (TrialId::from(i), payload_factory(i))))
            .await
    }

    /// Submit only the selected trial numbers. Numbers outside
    /// `1..=trial_count` are dropped with a warning.
    pub async fn submit_selected<F>(
        &mut self,
        selection: &TrialSelection,
        trial_count: u64,
        mut payload_factory: F,
    ) -> FanoutResult<Vec<Trial>>
    where
        F: FnMut(u64) -> serde_json::Value,
    {
        let (kept, dropped) = selection.within(1..=trial_count);
        if !dropped.is_empty() {
            let dropped: TrialSelection = dropped.into_iter().collect();
            warn!(
                dropped = %dropped,
                trial_count,
                "ignoring trial numbers outside the run"
            );
        }
        info!(trials = %kept, "submitting selected trials");
        self.submit_batch(kept.iter().map(|i| (TrialId::from(i), payload_factory(i))))
            .await
    }

    /// Submit caller-identified trials in iteration order.
    ///
    /// Stops at the first duplicate identity; trials submitted before it stay
    /// in the registry.
    pub async fn submit_batch<I>(&mut self, trials: I) -> FanoutResult<Vec<Trial>>
    where
        I: IntoIterator<Item = (TrialId, serde_json::Value)>,
    {
        let mut submitted = Vec::new();
        for (id, payload) in trials {
            submitted.push(self.submit_one(id, payload).await?);
        }
        let failed = submitted.iter().filter(|t| t.handle.is_none()).count();
        if failed > 0 {
            warn!(failed, total = submitted.len(), "some submissions failed");
        }
        Ok(submitted)
    }

    /// Submit a single trial. A pool refusal, or a handle the pool already
    /// gave another trial, is recorded on the trial, not returned; only a
    /// duplicate identity is an error.
    pub async fn submit_one(&mut self, id: TrialId, payload: serde_json::Value) -> FanoutResult<Trial> {
        if self.registry.contains(&id) {
            return Err(OrchestratorError::DuplicateTrial { trial: id }.into());
        }

        let trial = match self.client.submit(&payload).await {
            Ok(handle) => match self.registry.get_by_handle(&handle) {
                Some(owner) => {
                    let error = OrchestratorError::DuplicateHandle {
                        handle: handle.to_string(),
                        owner: owner.id.clone(),
                    };
                    warn!(trial = %id, error = %error, "pool reused a handle");
                    Trial::submit_failed(id, payload, error.to_string())
                }
                None => {
                    debug!(trial = %id, handle = %handle, "trial queued");
                    Trial::queued(id, payload, handle)
                }
            },
            Err(source) => {
                let error = SubmissionError {
                    trial: id.clone(),
                    source,
                };
                warn!(trial = %id, error = %error, "submission failed");
                Trial::submit_failed(id, payload, error.to_string())
            }
        };

        self.registry.insert(trial.clone())?;
        Ok(trial)
    }
}
