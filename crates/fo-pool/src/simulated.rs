//! Simulated (in-process) worker pool.
//!
//! Executes nothing: every trial follows a [`TrialScript`] on a clock that
//! ticks once per [`QueueClient::snapshot`] call. Useful for orchestrator
//! tests, demos, and rehearsing failure handling before pointing the
//! orchestrator at a real cluster.

use async_trait::async_trait;
use fo_types::{
    AdvisoryPublisher, Handle, PoolError, PoolResult, QueueClient, QueueSnapshot, TrialOutput,
};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::script::TrialScript;

/// Configuration for the simulated pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedPoolConfig {
    /// Number of workers; at most this many trials run at once.
    pub workers: usize,
    /// Seed for randomly generated scripts.
    pub seed: u64,
    /// Bounds (inclusive) for randomly generated running time, in polls.
    pub min_running_polls: u32,
    pub max_running_polls: u32,
    /// Upper bound (inclusive) for randomly generated queue time, in polls.
    pub max_queued_polls: u32,
    /// Pids are assigned as `base_pid + worker slot`.
    pub base_pid: u32,
}

impl Default for SimulatedPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            seed: 0,
            min_running_polls: 1,
            max_running_polls: 5,
            max_queued_polls: 2,
            base_pid: 4000,
        }
    }
}

type ScriptFn = Box<dyn FnMut(u64, &serde_json::Value) -> TrialScript + Send>;

enum ScriptSource {
    Random(ChaCha8Rng),
    Custom(ScriptFn),
}

impl ScriptSource {
    fn next(
        &mut self,
        config: &SimulatedPoolConfig,
        index: u64,
        payload: &serde_json::Value,
    ) -> TrialScript {
        match self {
            ScriptSource::Random(rng) => {
                let max_running = config.max_running_polls.max(config.min_running_polls);
                TrialScript::complete(
                    rng.random_range(0..=config.max_queued_polls),
                    rng.random_range(config.min_running_polls..=max_running),
                )
            }
            ScriptSource::Custom(script) => script(index, payload),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued { remaining: u32 },
    /// `remaining == None` runs forever.
    Running { remaining: Option<u32>, pid: u32 },
    Done,
    Lost,
}

#[derive(Debug)]
struct SimTask {
    index: u64,
    payload: serde_json::Value,
    script: TrialScript,
    phase: Phase,
}

impl SimTask {
    fn output(&self, pid: u32) -> TrialOutput {
        let value = match &self.script {
            TrialScript::Complete {
                output: Some(value),
                ..
            } => value.clone(),
            _ => json!({
                "trial": self.index,
                "payload": self.payload,
                "pid": pid,
            }),
        };
        TrialOutput::new(value).with_worker_pid(pid)
    }
}

/// Pending fault injections.
#[derive(Debug, Default)]
struct Faults {
    reject_submissions: u32,
    fail_queries: u32,
    fail_fetches: u32,
    withheld: HashMap<Handle, u32>,
    hidden_worker_checks: u32,
}

struct PoolState {
    clock: u64,
    submitted: u64,
    started: u64,
    order: Vec<Handle>,
    tasks: HashMap<Handle, SimTask>,
    results: HashMap<Handle, TrialOutput>,
    delivered: Vec<Handle>,
    fetch_log: Vec<Vec<Handle>>,
    faults: Faults,
    scripts: ScriptSource,
}

impl PoolState {
    fn new(scripts: ScriptSource) -> Self {
        Self {
            clock: 0,
            submitted: 0,
            started: 0,
            order: Vec::new(),
            tasks: HashMap::new(),
            results: HashMap::new(),
            delivered: Vec::new(),
            fetch_log: Vec::new(),
            faults: Faults::default(),
            scripts,
        }
    }

    fn check_reachable(&mut self) -> PoolResult<()> {
        if self.faults.fail_queries > 0 {
            self.faults.fail_queries -= 1;
            return Err(PoolError::Unreachable {
                message: "simulated controller timeout".into(),
            });
        }
        Ok(())
    }

    /// Advance the clock one step. Returns advisory updates to publish once
    /// the state lock is released.
    fn tick(&mut self, config: &SimulatedPoolConfig) -> Vec<(Handle, &'static str)> {
        self.clock += 1;
        let mut advisories = Vec::new();
        let mut busy = self
            .tasks
            .values()
            .filter(|task| matches!(task.phase, Phase::Running { .. }))
            .count();

        for handle in &self.order {
            let Some(task) = self.tasks.get_mut(handle) else {
                continue;
            };

            match task.phase {
                Phase::Running {
                    remaining: Some(left),
                    pid,
                } => {
                    let left = left.saturating_sub(1);
                    if left == 0 {
                        self.results.insert(handle.clone(), task.output(pid));
                        task.phase = Phase::Done;
                        busy -= 1;
                    } else {
                        if left == 1 {
                            advisories.push((handle.clone(), "finishing"));
                        }
                        task.phase = Phase::Running {
                            remaining: Some(left),
                            pid,
                        };
                    }
                }
                Phase::Queued { remaining } if remaining > 0 => {
                    task.phase = Phase::Queued {
                        remaining: remaining - 1,
                    };
                }
                Phase::Queued { .. } => {
                    if matches!(task.script, TrialScript::Lost { .. }) {
                        debug!(handle = %handle, "simulated worker lost trial");
                        task.phase = Phase::Lost;
                        continue;
                    }
                    if busy >= config.workers {
                        continue;
                    }

                    let slot = (self.started % config.workers as u64) as u32;
                    let pid = config.base_pid + slot;
                    self.started += 1;
                    busy += 1;
                    advisories.push((handle.clone(), "running"));

                    task.phase = match task.script {
                        TrialScript::Complete {
                            running_polls: 0, ..
                        } => {
                            self.results.insert(handle.clone(), task.output(pid));
                            busy -= 1;
                            Phase::Done
                        }
                        TrialScript::Complete { running_polls, .. } => Phase::Running {
                            remaining: Some(running_polls),
                            pid,
                        },
                        _ => Phase::Running {
                            remaining: None,
                            pid,
                        },
                    };
                }
                Phase::Running { remaining: None, .. } | Phase::Done | Phase::Lost => {}
            }
        }

        advisories
    }

    fn counts(&self) -> QueueSnapshot {
        let mut queued = 0;
        let mut running = 0;
        let mut unassigned = 0;
        for task in self.tasks.values() {
            match task.phase {
                Phase::Queued { remaining } if remaining > 0 => queued += 1,
                Phase::Queued { .. } => unassigned += 1,
                Phase::Running { .. } => running += 1,
                Phase::Done | Phase::Lost => {}
            }
        }
        QueueSnapshot::new(queued, running, self.results.len(), unassigned)
    }
}

/// A fully in-process worker pool with scripted trial lifecycles.
pub struct SimulatedPool {
    config: SimulatedPoolConfig,
    state: Mutex<PoolState>,
    advisory: Option<AdvisoryPublisher>,
}

impl fmt::Debug for SimulatedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedPool")
            .field("config", &self.config)
            .field("clock", &state.clock)
            .field("tasks", &state.tasks.len())
            .field("results", &state.results.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedPool {
    /// Create a pool whose trials get randomly generated scripts, seeded from
    /// `config.seed`.
    pub fn new(config: SimulatedPoolConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            state: Mutex::new(PoolState::new(ScriptSource::Random(rng))),
            advisory: None,
        }
    }

    /// Create a pool with default settings.
    pub fn with_defaults() -> Self {
        Self::new(SimulatedPoolConfig::default())
    }

    /// Create a pool where `script(index, payload)` decides how the
    /// `index`-th submission (1-based) behaves.
    pub fn scripted<F>(config: SimulatedPoolConfig, script: F) -> Self
    where
        F: FnMut(u64, &serde_json::Value) -> TrialScript + Send + 'static,
    {
        Self {
            config,
            state: Mutex::new(PoolState::new(ScriptSource::Custom(Box::new(script)))),
            advisory: None,
        }
    }

    /// Publish "running"/"finishing" advisories on `publisher`.
    pub fn with_advisory(mut self, publisher: AdvisoryPublisher) -> Self {
        self.advisory = Some(publisher);
        self
    }

    pub fn config(&self) -> &SimulatedPoolConfig {
        &self.config
    }

    // -- fault injection ----------------------------------------------------

    /// Reject the next `n` submissions as saturated.
    pub fn reject_next_submissions(&self, n: u32) {
        self.state.lock().faults.reject_submissions = n;
    }

    /// Fail the next `n` queries (snapshot, handle sets, fetch, worker count)
    /// as unreachable.
    pub fn fail_next_queries(&self, n: u32) {
        self.state.lock().faults.fail_queries = n;
    }

    /// Fail the next `n` fetch-and-purge calls without purging anything.
    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().faults.fail_fetches = n;
    }

    /// Leave `handle` out of the next `fetches` fetch-and-purge responses.
    /// Its result stays in the store and is still reported as completed.
    pub fn withhold_result(&self, handle: &Handle, fetches: u32) {
        self.state
            .lock()
            .faults
            .withheld
            .insert(handle.clone(), fetches);
    }

    /// Report zero workers for the next `checks` worker-count queries.
    pub fn hide_workers_for(&self, checks: u32) {
        self.state.lock().faults.hidden_worker_checks = checks;
    }

    // -- inspection ---------------------------------------------------------

    /// Number of snapshots taken so far.
    pub fn clock(&self) -> u64 {
        self.state.lock().clock
    }

    /// Handles in submission order.
    pub fn handles(&self) -> Vec<Handle> {
        self.state.lock().order.clone()
    }

    /// Handle of the `index`-th submission (1-based).
    pub fn handle_for(&self, index: u64) -> Option<Handle> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .find(|handle| state.tasks.get(*handle).map(|task| task.index) == Some(index))
            .cloned()
    }

    /// Handle batches passed to every fetch-and-purge call, in call order.
    pub fn fetch_log(&self) -> Vec<Vec<Handle>> {
        self.state.lock().fetch_log.clone()
    }

    /// Handles whose results were handed out and purged, in delivery order.
    pub fn delivered(&self) -> Vec<Handle> {
        self.state.lock().delivered.clone()
    }

    fn publish(&self, advisories: Vec<(Handle, &'static str)>) {
        if let Some(publisher) = &self.advisory {
            for (handle, status) in advisories {
                publisher.publish(handle, status);
            }
        }
    }
}

#[async_trait]
impl QueueClient for SimulatedPool {
    async fn submit(&self, payload: &serde_json::Value) -> PoolResult<Handle> {
        let mut state = self.state.lock();
        if state.faults.reject_submissions > 0 {
            state.faults.reject_submissions -= 1;
            return Err(PoolError::Saturated {
                message: "simulated scheduler queue is full".into(),
            });
        }

        state.submitted += 1;
        let index = state.submitted;
        let script = state.scripts.next(&self.config, index, payload);
        let handle = Handle::from(Uuid::new_v4());
        let phase = Phase::Queued {
            remaining: script.queued_polls(),
        };

        state.tasks.insert(
            handle.clone(),
            SimTask {
                index,
                payload: payload.clone(),
                script,
                phase,
            },
        );
        state.order.push(handle.clone());
        debug!(handle = %handle, index, "simulated pool accepted trial");
        Ok(handle)
    }

    async fn snapshot(&self) -> PoolResult<QueueSnapshot> {
        let (snapshot, advisories) = {
            let mut state = self.state.lock();
            state.check_reachable()?;
            let advisories = state.tick(&self.config);
            (state.counts(), advisories)
        };
        self.publish(advisories);
        Ok(snapshot)
    }

    async fn running_handles(&self) -> PoolResult<HashSet<Handle>> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        Ok(state
            .tasks
            .iter()
            .filter(|(_, task)| matches!(task.phase, Phase::Running { .. }))
            .map(|(handle, _)| handle.clone())
            .collect())
    }

    async fn completed_handles(&self) -> PoolResult<HashSet<Handle>> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        Ok(state.results.keys().cloned().collect())
    }

    async fn fetch_and_purge(&self, handles: &[Handle]) -> PoolResult<HashMap<Handle, TrialOutput>> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        state.fetch_log.push(handles.to_vec());

        if state.faults.fail_fetches > 0 {
            state.faults.fail_fetches -= 1;
            return Err(PoolError::Unreachable {
                message: "simulated result store timeout".into(),
            });
        }

        let mut outputs = HashMap::with_capacity(handles.len());
        for handle in handles {
            if let Some(left) = state.faults.withheld.get_mut(handle) {
                if *left > 0 {
                    *left -= 1;
                    continue;
                }
            }
            if let Some(output) = state.results.remove(handle) {
                state.delivered.push(handle.clone());
                outputs.insert(handle.clone(), output);
            }
        }

        debug!(
            requested = handles.len(),
            delivered = outputs.len(),
            "simulated pool purged results"
        );
        Ok(outputs)
    }

    async fn worker_count(&self) -> PoolResult<usize> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        if state.faults.hidden_worker_checks > 0 {
            state.faults.hidden_worker_checks -= 1;
            return Ok(0);
        }
        Ok(self.config.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_worker() -> SimulatedPoolConfig {
        SimulatedPoolConfig {
            workers: 1,
            ..Default::default()
        }
    }

    fn ample() -> SimulatedPoolConfig {
        SimulatedPoolConfig {
            workers: 16,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_complete_script_lifecycle() {
        let pool = SimulatedPool::scripted(ample(), |_, _| TrialScript::complete(1, 2));
        let handle = pool.submit(&json!({"x": 1})).await.unwrap();

        assert_eq!(pool.state.lock().counts().queued, 1);

        // poll 1: queue wait elapsed, waiting for a worker
        let snap = pool.snapshot().await.unwrap();
        assert_eq!((snap.running, snap.unassigned), (0, 1));

        // poll 2: started
        let snap = pool.snapshot().await.unwrap();
        assert_eq!(snap.running, 1);
        assert!(pool.running_handles().await.unwrap().contains(&handle));

        // poll 3: one more running poll
        pool.snapshot().await.unwrap();
        assert!(pool.completed_handles().await.unwrap().is_empty());

        // poll 4: finished
        let snap = pool.snapshot().await.unwrap();
        assert!(snap.is_idle());
        assert_eq!(snap.completed, 1);
        assert!(pool.completed_handles().await.unwrap().contains(&handle));
    }

    #[tokio::test]
    async fn test_zero_length_script_completes_on_first_poll() {
        let pool = SimulatedPool::scripted(ample(), |_, _| TrialScript::complete(0, 0));
        let handle = pool.submit(&json!(null)).await.unwrap();

        // not yet ticked: waiting for a worker
        assert_eq!(pool.state.lock().counts().unassigned, 1);

        pool.snapshot().await.unwrap();
        assert!(pool.completed_handles().await.unwrap().contains(&handle));
    }

    #[tokio::test]
    async fn test_fetch_and_purge_is_at_most_once() {
        let pool = SimulatedPool::scripted(ample(), |_, _| {
            TrialScript::complete(0, 0).with_output(json!("done"))
        });
        let handle = pool.submit(&json!(null)).await.unwrap();
        pool.snapshot().await.unwrap();

        let first = pool.fetch_and_purge(&[handle.clone()]).await.unwrap();
        assert_eq!(first[&handle].value, json!("done"));
        assert!(first[&handle].worker_pid.is_some());

        let second = pool.fetch_and_purge(&[handle.clone()]).await.unwrap();
        assert!(second.is_empty());
        assert!(pool.completed_handles().await.unwrap().is_empty());
        assert_eq!(pool.delivered(), vec![handle]);
        assert_eq!(pool.fetch_log().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_capacity_leaves_trials_unassigned() {
        let pool = SimulatedPool::scripted(one_worker(), |_, _| TrialScript::complete(0, 2));
        pool.submit(&json!(1)).await.unwrap();
        pool.submit(&json!(2)).await.unwrap();

        let snap = pool.snapshot().await.unwrap();
        assert_eq!(snap.running, 1);
        assert_eq!(snap.unassigned, 1);
        assert!(!snap.is_idle());
    }

    #[tokio::test]
    async fn test_stuck_and_lost_scripts() {
        let pool = SimulatedPool::scripted(ample(), |index, _| {
            if index == 1 {
                TrialScript::stuck()
            } else {
                TrialScript::lost()
            }
        });
        let stuck = pool.submit(&json!(1)).await.unwrap();
        let lost = pool.submit(&json!(2)).await.unwrap();

        for _ in 0..5 {
            let snap = pool.snapshot().await.unwrap();
            assert_eq!(snap.running, 1);
            assert_eq!(snap.unassigned, 0);
        }
        let running = pool.running_handles().await.unwrap();
        assert!(running.contains(&stuck));
        assert!(!running.contains(&lost));
        assert!(!pool.completed_handles().await.unwrap().contains(&lost));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let pool = SimulatedPool::scripted(ample(), |_, _| TrialScript::complete(0, 0));

        pool.reject_next_submissions(1);
        assert!(matches!(
            pool.submit(&json!(1)).await,
            Err(PoolError::Saturated { .. })
        ));
        let handle = pool.submit(&json!(2)).await.unwrap();

        pool.fail_next_queries(1);
        assert!(pool.snapshot().await.is_err());
        assert_eq!(pool.clock(), 0);
        pool.snapshot().await.unwrap();

        pool.withhold_result(&handle, 1);
        assert!(pool.fetch_and_purge(&[handle.clone()]).await.unwrap().is_empty());
        assert!(pool.completed_handles().await.unwrap().contains(&handle));

        pool.fail_next_fetches(1);
        assert!(pool.fetch_and_purge(&[handle.clone()]).await.is_err());
        assert_eq!(pool.fetch_and_purge(&[handle.clone()]).await.unwrap().len(), 1);

        pool.hide_workers_for(2);
        assert_eq!(pool.worker_count().await.unwrap(), 0);
        assert_eq!(pool.worker_count().await.unwrap(), 0);
        assert_eq!(pool.worker_count().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_advisories_published() {
        let (publisher, receiver) = fo_types::advisory_channel();
        let pool = SimulatedPool::scripted(ample(), |_, _| TrialScript::complete(0, 2))
            .with_advisory(publisher);
        let handle = pool.submit(&json!(null)).await.unwrap();

        pool.snapshot().await.unwrap();
        pool.snapshot().await.unwrap();

        let statuses: Vec<String> = receiver
            .drain()
            .into_iter()
            .filter(|update| update.handle == handle)
            .map(|update| update.status)
            .collect();
        assert_eq!(statuses, vec!["running".to_string(), "finishing".to_string()]);
    }

    #[tokio::test]
    async fn test_random_scripts_are_seeded() {
        let config = SimulatedPoolConfig {
            seed: 42,
            ..ample()
        };
        let a = SimulatedPool::new(config.clone());
        let b = SimulatedPool::new(config);
        for i in 0..8 {
            a.submit(&json!(i)).await.unwrap();
            b.submit(&json!(i)).await.unwrap();
        }

        let scripts = |pool: &SimulatedPool| {
            let state = pool.state.lock();
            state
                .order
                .iter()
                .map(|handle| state.tasks[handle].script.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(scripts(&a), scripts(&b));
        assert_eq!(pool_index(&a, 3), Some(3));
    }

    fn pool_index(pool: &SimulatedPool, index: u64) -> Option<u64> {
        let handle = pool.handle_for(index)?;
        pool.state.lock().tasks.get(&handle).map(|task| task.index)
    }
}
