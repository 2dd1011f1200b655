//! Orchestrator configuration.

use fo_types::{config_error, FanoutResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for one orchestrator run.
///
/// Every field has a default, so a JSON config file only needs the keys it
/// wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sleep between iterations.
    pub poll_interval_ms: u64,
    /// Consecutive failed poll passes before the run gives up on the pool.
    pub max_consecutive_failures: u32,
    /// Consecutive iterations with an idle pool, outstanding trials and no
    /// progress before the run is declared stalled. `None` waits forever.
    pub stall_limit: Option<u32>,
    /// Hard cap on loop iterations.
    pub max_iterations: Option<u64>,
    pub startup_wait_tries: u32,
    pub startup_wait_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            max_consecutive_failures: 10,
            stall_limit: Some(20),
            max_iterations: None,
            startup_wait_tries: 5,
            startup_wait_interval_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_wait_interval(&self) -> Duration {
        Duration::from_millis(self.startup_wait_interval_ms)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_consecutive_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    pub fn with_stall_limit(mut self, limit: Option<u32>) -> Self {
        self.stall_limit = limit;
        self
    }

    pub fn with_max_iterations(mut self, limit: Option<u64>) -> Self {
        self.max_iterations = limit;
        self
    }

    pub fn with_startup_wait(mut self, tries: u32, interval: Duration) -> Self {
        self.startup_wait_tries = tries;
        self.startup_wait_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> FanoutResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(config_error!("poll_interval_ms must be positive"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(config_error!("max_consecutive_failures must be positive"));
        }
        if self.stall_limit == Some(0) {
            return Err(config_error!("stall_limit must be positive when set"));
        }
        if self.max_iterations == Some(0) {
            return Err(config_error!("max_iterations must be positive when set"));
        }
        if self.startup_wait_tries == 0 {
            return Err(config_error!("startup_wait_tries must be positive"));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> FanoutResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> FanoutResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read {}: {}", path.display(), e))?;
        Self::from_json_str(&contents)
    }
}
