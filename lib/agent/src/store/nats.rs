//! NATS JetStream key-value store.
//!
//! Each concern gets its own bucket with a history of one:
//!
//! - runs: `<run_id>` → sealed [`Run`]
//! - schedules: `<queue>.<due millis>.<run_id>` → sealed schedule record,
//!   purged on close
//! - leases: `<run_id>` → sealed [`LeaseRecord`], swapped by revision
//! - links: `wf.<name>.<run_id>` and `child.<parent>.<child>`, empty values
//! - logs: `<run_id>.<ulid>` → sealed [`LogEntry`]
//!
//! Lease acquisition is a compare-and-swap on the key's revision, so two
//! agents racing for the same run cannot both win.

use super::{LeaseRecord, LogEntry, NextRun, Store, schedule_precision};
use crate::error::StoreError;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use driftwood_core::{AgentId, Clock, RunId};
use driftwood_workflow::envelope::{open, seal};
use driftwood_workflow::{Operation, Run};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use ulid::Ulid;

const RUNS_BUCKET: &str = "driftwood-runs";
const SCHEDULES_BUCKET: &str = "driftwood-schedules";
const LEASES_BUCKET: &str = "driftwood-leases";
const LINKS_BUCKET: &str = "driftwood-links";
const LOGS_BUCKET: &str = "driftwood-logs";

/// Configuration for the NATS-backed store.
#[derive(Debug, Clone)]
pub struct NatsStoreConfig {
    /// NATS server URL.
    pub url: String,
    /// Bucket for run logs (defaults to driftwood-runs).
    pub runs_bucket: Option<String>,
    /// Bucket for schedule entries (defaults to driftwood-schedules).
    pub schedules_bucket: Option<String>,
    /// Bucket for leases (defaults to driftwood-leases).
    pub leases_bucket: Option<String>,
    /// Bucket for workflow and parent/child links (defaults to driftwood-links).
    pub links_bucket: Option<String>,
    /// Bucket for free-text run logs (defaults to driftwood-logs).
    pub logs_bucket: Option<String>,
}

impl NatsStoreConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            runs_bucket: None,
            schedules_bucket: None,
            leases_bucket: None,
            links_bucket: None,
            logs_bucket: None,
        }
    }

    fn runs(&self) -> &str {
        self.runs_bucket.as_deref().unwrap_or(RUNS_BUCKET)
    }

    fn schedules(&self) -> &str {
        self.schedules_bucket.as_deref().unwrap_or(SCHEDULES_BUCKET)
    }

    fn leases(&self) -> &str {
        self.leases_bucket.as_deref().unwrap_or(LEASES_BUCKET)
    }

    fn links(&self) -> &str {
        self.links_bucket.as_deref().unwrap_or(LINKS_BUCKET)
    }

    fn logs(&self) -> &str {
        self.logs_bucket.as_deref().unwrap_or(LOGS_BUCKET)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ScheduleRecord {
    run_id: RunId,
    due: DateTime<Utc>,
    operation: Option<Operation>,
}

/// A [`Store`] on JetStream key-value buckets.
pub struct NatsStore {
    runs: kv::Store,
    schedules: kv::Store,
    leases: kv::Store,
    links: kv::Store,
    logs: kv::Store,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for NatsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsStore").finish_non_exhaustive()
    }
}

fn read_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Read {
        details: e.to_string(),
    }
}

fn write_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Write {
        details: e.to_string(),
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    open(bytes).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        details: e.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    seal(value).map_err(write_error)
}

fn is_live(entry: &kv::Entry) -> bool {
    matches!(entry.operation, kv::Operation::Put)
}

fn schedule_key(queue: &str, run_id: &RunId, due: DateTime<Utc>) -> String {
    format!("{queue}.{:015}.{run_id}", due.timestamp_millis())
}

/// Splits a schedule key of `queue` into its due millis and run id.
fn parse_schedule_key(queue: &str, key: &str) -> Option<(i64, RunId)> {
    let rest = key.strip_prefix(queue)?.strip_prefix('.')?;
    let (millis, run_id) = rest.split_once('.')?;
    Some((millis.parse().ok()?, run_id.parse().ok()?))
}

impl NatsStore {
    /// Connects and makes sure every bucket exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or bucket setup fails.
    pub async fn connect(config: &NatsStoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection {
                details: e.to_string(),
            })?;
        Self::with_client(client, config, clock).await
    }

    /// Uses an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if bucket setup fails.
    pub async fn with_client(
        client: async_nats::Client,
        config: &NatsStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let jetstream = jetstream::new(client);
        let store = Self {
            runs: Self::ensure_bucket(&jetstream, config.runs()).await?,
            schedules: Self::ensure_bucket(&jetstream, config.schedules()).await?,
            leases: Self::ensure_bucket(&jetstream, config.leases()).await?,
            links: Self::ensure_bucket(&jetstream, config.links()).await?,
            logs: Self::ensure_bucket(&jetstream, config.logs()).await?,
            clock,
        };
        info!(url = %config.url, "NATS store ready");
        Ok(store)
    }

    async fn ensure_bucket(
        jetstream: &jetstream::Context,
        bucket: &str,
    ) -> Result<kv::Store, StoreError> {
        if let Ok(store) = jetstream.get_key_value(bucket).await {
            return Ok(store);
        }
        debug!(bucket, "creating key-value bucket");
        jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| StoreError::Connection {
                details: format!("failed to create bucket {bucket}: {e}"),
            })
    }

    async fn keys_with_prefix(bucket: &kv::Store, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys: Vec<String> = bucket
            .keys()
            .await
            .map_err(read_error)?
            .try_collect()
            .await
            .map_err(read_error)?;
        Ok(keys.into_iter().filter(|key| key.starts_with(prefix)).collect())
    }

    async fn live_entry(bucket: &kv::Store, key: &str) -> Result<Option<kv::Entry>, StoreError> {
        Ok(bucket
            .entry(key)
            .await
            .map_err(read_error)?
            .filter(is_live))
    }
}

#[async_trait]
impl Store for NatsStore {
    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn create_or_get_run(&self, run_id: &RunId) -> Result<Run, StoreError> {
        if let Some(run) = self.read_run(run_id).await? {
            return Ok(run);
        }
        let run = Run::new(run_id.clone());
        let key = run_id.to_string();
        if self
            .runs
            .create(&key, encode(&run)?.into())
            .await
            .is_err()
        {
            // Lost a creation race; the winner's record is authoritative.
            return self.read_run(run_id).await?.ok_or_else(|| StoreError::Write {
                details: format!("run {run_id} could not be created"),
            });
        }
        Ok(run)
    }

    async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        let key = run_id.to_string();
        self.runs
            .get(&key)
            .await
            .map_err(read_error)?
            .map(|bytes| decode(&key, &bytes))
            .transpose()
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, operations = run.operations.len()))]
    async fn persist_run(&self, run: &Run) -> Result<(), StoreError> {
        self.runs
            .put(run.run_id.to_string(), encode(run)?.into())
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn add_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
        operation: Option<Operation>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut due = schedule_precision(due);
        loop {
            let key = schedule_key(queue, run_id, due);
            let record = ScheduleRecord {
                run_id: run_id.clone(),
                due,
                operation: operation.clone(),
            };
            match self.schedules.create(&key, encode(&record)?.into()).await {
                Ok(_) => return Ok(due),
                Err(e) => {
                    if Self::live_entry(&self.schedules, &key).await?.is_none() {
                        return Err(write_error(e));
                    }
                    due += Duration::milliseconds(1);
                }
            }
        }
    }

    async fn close_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = schedule_key(queue, run_id, schedule_precision(due));
        self.schedules.purge(&key).await.map_err(write_error)
    }

    async fn read_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
    ) -> Result<Option<Operation>, StoreError> {
        let key = schedule_key(queue, run_id, schedule_precision(due));
        let bytes = self
            .schedules
            .get(&key)
            .await
            .map_err(read_error)?
            .ok_or_else(|| StoreError::ScheduleClosed {
                run_id: run_id.clone(),
            })?;
        let record: ScheduleRecord = decode(&key, &bytes)?;
        Ok(record.operation)
    }

    #[instrument(skip(self, exclude), fields(excluded = exclude.len()))]
    async fn next_run(
        &self,
        queue: &str,
        exclude: &[RunId],
    ) -> Result<Option<NextRun>, StoreError> {
        let now = self.clock.now().timestamp_millis();
        let mut candidates: Vec<(i64, RunId, String)> =
            Self::keys_with_prefix(&self.schedules, &format!("{queue}."))
                .await?
                .into_iter()
                .filter_map(|key| {
                    let (millis, run_id) = parse_schedule_key(queue, &key)?;
                    (millis <= now && !exclude.contains(&run_id)).then_some((millis, run_id, key))
                })
                .collect();
        candidates.sort_by_key(|(millis, _, _)| *millis);

        // Ties on the due instant are broken by revision, i.e. insertion order.
        for group in candidates.chunk_by(|a, b| a.0 == b.0) {
            let mut earliest: Option<(u64, &RunId, i64)> = None;
            for (millis, run_id, key) in group {
                if let Some(entry) = Self::live_entry(&self.schedules, key).await?
                    && earliest.is_none_or(|(revision, _, _)| entry.revision < revision)
                {
                    earliest = Some((entry.revision, run_id, *millis));
                }
            }
            if let Some((_, run_id, millis)) = earliest {
                let schedule = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                    StoreError::Corrupt {
                        key: run_id.to_string(),
                        details: format!("due date {millis} out of range"),
                    }
                })?;
                return Ok(Some(NextRun {
                    run_id: run_id.clone(),
                    schedule,
                }));
            }
        }
        Ok(None)
    }

    async fn active_leases(&self, lease_seconds: u64) -> Result<Vec<RunId>, StoreError> {
        let now = self.clock.now();
        let mut active = Vec::new();
        for key in Self::keys_with_prefix(&self.leases, "").await? {
            let Some(entry) = Self::live_entry(&self.leases, &key).await? else {
                continue;
            };
            let lease: LeaseRecord = decode(&key, &entry.value)?;
            if lease.is_active(now, lease_seconds)
                && let Ok(run_id) = key.parse()
            {
                active.push(run_id);
            }
        }
        Ok(active)
    }

    #[instrument(skip(self), fields(run_id = %run_id, holder = %holder))]
    async fn acquire_lease(
        &self,
        run_id: &RunId,
        holder: AgentId,
        lease_seconds: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let key = run_id.to_string();
        let value = encode(&LeaseRecord {
            holder,
            renewed_at: now,
        })?;
        match Self::live_entry(&self.leases, &key).await? {
            Some(entry) => {
                let current: LeaseRecord = decode(&key, &entry.value)?;
                if current.is_active(now, lease_seconds) {
                    return Ok(false);
                }
                Ok(self
                    .leases
                    .update(&key, value.into(), entry.revision)
                    .await
                    .is_ok())
            }
            None => Ok(self.leases.create(&key, value.into()).await.is_ok()),
        }
    }

    async fn renew_lease(&self, run_id: &RunId, holder: AgentId) -> Result<bool, StoreError> {
        let key = run_id.to_string();
        let Some(entry) = Self::live_entry(&self.leases, &key).await? else {
            return Ok(false);
        };
        let current: LeaseRecord = decode(&key, &entry.value)?;
        if current.holder != holder {
            return Ok(false);
        }
        let value = encode(&LeaseRecord {
            holder,
            renewed_at: self.clock.now(),
        })?;
        Ok(self
            .leases
            .update(&key, value.into(), entry.revision)
            .await
            .is_ok())
    }

    async fn remove_lease(&self, run_id: &RunId, holder: AgentId) -> Result<(), StoreError> {
        let key = run_id.to_string();
        let Some(entry) = Self::live_entry(&self.leases, &key).await? else {
            return Ok(());
        };
        let current: LeaseRecord = decode(&key, &entry.value)?;
        if current.holder == holder {
            self.leases.delete(&key).await.map_err(write_error)?;
        }
        Ok(())
    }

    async fn write_workflow_link(&self, name: &str, run_id: &RunId) -> Result<(), StoreError> {
        self.links
            .put(format!("wf.{name}.{run_id}"), Vec::<u8>::new().into())
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn read_workflow_links(&self, name: &str) -> Result<Vec<RunId>, StoreError> {
        let prefix = format!("wf.{name}.");
        let mut runs: Vec<RunId> = Self::keys_with_prefix(&self.links, &prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix)?.parse().ok())
            .collect();
        runs.sort();
        Ok(runs)
    }

    async fn write_parent_child_link(
        &self,
        parent: &RunId,
        child: &RunId,
    ) -> Result<(), StoreError> {
        self.links
            .put(format!("child.{parent}.{child}"), Vec::<u8>::new().into())
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn read_children(&self, parent: &RunId) -> Result<Vec<RunId>, StoreError> {
        let prefix = format!("child.{parent}.");
        let mut children: Vec<RunId> = Self::keys_with_prefix(&self.links, &prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix)?.parse().ok())
            .collect();
        children.sort();
        Ok(children)
    }

    async fn append_log(&self, run_id: &RunId, message: &str) -> Result<(), StoreError> {
        let entry = LogEntry {
            at: self.clock.now(),
            message: message.to_string(),
        };
        self.logs
            .put(format!("{run_id}.{}", Ulid::new()), encode(&entry)?.into())
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, StoreError> {
        let mut keys = Self::keys_with_prefix(&self.logs, &format!("{run_id}.")).await?;
        keys.sort();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.logs.get(&key).await.map_err(read_error)? {
                entries.push(decode(&key, &bytes)?);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_keys_sort_by_due() {
        let run_id = RunId::generate("nap").unwrap();
        let early = DateTime::from_timestamp_millis(9_000).unwrap();
        let late = DateTime::from_timestamp_millis(10_000).unwrap();
        assert!(schedule_key("q", &run_id, early) < schedule_key("q", &run_id, late));
    }

    #[test]
    fn schedule_key_parses_back() {
        let run_id = RunId::generate("nap").unwrap();
        let due = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let key = schedule_key("default", &run_id, due);
        assert_eq!(
            parse_schedule_key("default", &key),
            Some((1_700_000_000_123, run_id))
        );
        assert_eq!(parse_schedule_key("other", &key), None);
    }

    #[test]
    fn default_buckets_can_be_overridden() {
        let mut config = NatsStoreConfig::new("nats://localhost:4222");
        assert_eq!(config.leases(), "driftwood-leases");
        config.leases_bucket = Some("staging-leases".to_string());
        assert_eq!(config.leases(), "staging-leases");
    }
}
