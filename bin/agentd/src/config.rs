//! Daemon configuration.
//!
//! Loaded from `DRIFTWOOD_`-prefixed environment variables, with `__`
//! separating nested sections: `DRIFTWOOD_NATS_URL`,
//! `DRIFTWOOD_AGENT__QUEUE`, `DRIFTWOOD_POOL__MAX_WORKERS` and so on.

use driftwood_agent::{AgentConfig, AgentError, NatsStoreConfig, TransportKind};
use driftwood_pool::PoolConfig;
use serde::Deserialize;

/// What this process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Poll a queue and dispatch runs to workers.
    #[default]
    Agent,
    /// Host workers for remote agents.
    Worker,
}

/// Daemon configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub role: Role,

    /// Where workers run.
    #[serde(default)]
    pub transport: TransportKind,

    /// NATS server URL. Without it an agent keeps run state in memory.
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Subject prefix remote workers attach under.
    #[serde(default = "default_worker_subject_prefix")]
    pub worker_subject_prefix: String,

    /// Key-value bucket overrides.
    #[serde(default)]
    pub buckets: BucketConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Workflow to start once the agent is up.
    #[serde(default)]
    pub start_workflow: Option<String>,

    /// JSON arguments for `start_workflow`.
    #[serde(default)]
    pub start_kwargs: Option<String>,
}

fn default_worker_subject_prefix() -> String {
    "driftwood.worker".to_string()
}

/// Bucket names; unset ones use the store defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketConfig {
    pub runs: Option<String>,
    pub schedules: Option<String>,
    pub leases: Option<String>,
    pub links: Option<String>,
    pub logs: Option<String>,
}

impl BucketConfig {
    /// Store config for the server at `url`.
    #[must_use]
    pub fn store_config(&self, url: &str) -> NatsStoreConfig {
        NatsStoreConfig {
            runs_bucket: self.runs.clone(),
            schedules_bucket: self.schedules.clone(),
            leases_bucket: self.leases.clone(),
            links_bucket: self.links.clone(),
            logs_bucket: self.logs.clone(),
            ..NatsStoreConfig::new(url)
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::with_prefix("DRIFTWOOD"))
    }

    fn from_environment(env: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(env.prefix_separator("_").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Rejects combinations that need NATS when no URL is configured.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.nats_url.is_some() {
            return Ok(());
        }
        let needs_nats = match self.role {
            Role::Worker => Some("the worker role"),
            Role::Agent if self.transport == TransportKind::Remote => Some("the remote transport"),
            Role::Agent => None,
        };
        match needs_nats {
            Some(what) => Err(AgentError::Config {
                details: format!("{what} needs DRIFTWOOD_NATS_URL"),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> DaemonConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        DaemonConfig::from_environment(
            config::Environment::with_prefix("DRIFTWOOD").source(Some(vars)),
        )
        .unwrap()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]);
        assert_eq!(config.role, Role::Agent);
        assert_eq!(config.transport, TransportKind::Thread);
        assert_eq!(config.worker_subject_prefix, "driftwood.worker");
        assert_eq!(config.agent, AgentConfig::default());
        assert_eq!(config.pool, PoolConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn nested_sections_are_read() {
        let config = load(&[
            ("DRIFTWOOD_TRANSPORT", "inline"),
            ("DRIFTWOOD_AGENT__QUEUE", "billing"),
            ("DRIFTWOOD_AGENT__LEASE_SECONDS", "10"),
            ("DRIFTWOOD_POOL__MAX_WORKERS", "2"),
            ("DRIFTWOOD_BUCKETS__RUNS", "billing-runs"),
        ]);
        assert_eq!(config.transport, TransportKind::Inline);
        assert_eq!(config.agent.queue, "billing");
        assert_eq!(config.agent.lease_seconds, 10);
        assert_eq!(config.pool.max_workers, 2);

        let store = config.buckets.store_config("nats://localhost:4222");
        assert_eq!(store.runs_bucket.as_deref(), Some("billing-runs"));
        assert_eq!(store.logs_bucket, None);
    }

    #[test]
    fn worker_role_requires_nats() {
        let config = load(&[("DRIFTWOOD_ROLE", "worker")]);
        assert!(matches!(config.validate(), Err(AgentError::Config { .. })));

        let config = load(&[
            ("DRIFTWOOD_ROLE", "worker"),
            ("DRIFTWOOD_NATS_URL", "nats://localhost:4222"),
        ]);
        assert!(config.validate().is_ok());
    }
}
