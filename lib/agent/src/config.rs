//! Agent configuration.

use serde::Deserialize;
use std::time::Duration;

/// How the polling loop behaves.
///
/// Every field has a default, so an empty config section is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    /// Schedule queue this agent polls.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Delay between ticks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a lease stays active without renewal.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Runs a single tick tries to dispatch.
    #[serde(default = "default_max_acquire_per_tick")]
    pub max_acquire_per_tick: usize,
    /// How long a dispatched replay may go without its final reply before
    /// the worker is treated as dead. Defaults to the lease duration.
    #[serde(default)]
    pub reply_timeout_ms: Option<u64>,
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_seconds() -> u64 {
    2
}

fn default_max_acquire_per_tick() -> usize {
    1
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_seconds: default_lease_seconds(),
            max_acquire_per_tick: default_max_acquire_per_tick(),
            reply_timeout_ms: None,
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout_ms
            .map_or(Duration::from_secs(self.lease_seconds), Duration::from_millis)
    }
}
