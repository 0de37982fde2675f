//! Durable state the agent coordinates through.
//!
//! The store holds four things: run logs, the schedule queue that says when a
//! run is due (optionally carrying one operation to append), the lease table
//! that gives one agent exclusive ownership of a run, and secondary indexes
//! (workflow-name links, parent/child links, free-text logs) used only for
//! introspection.
//!
//! Schedule entries are identified by `(queue, run_id, due)`. Due dates are
//! kept at millisecond precision, and an add that would collide with an open
//! entry for the same run is moved forward by one millisecond, so callers must
//! use the due date [`Store::add_schedule`] returns.

mod memory;
mod nats;

pub use memory::MemoryStore;
pub use nats::{NatsStore, NatsStoreConfig};

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use driftwood_core::{AgentId, RunId};
use driftwood_workflow::{Operation, Run};
use serde::{Deserialize, Serialize};

/// The next due schedule entry in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextRun {
    pub run_id: RunId,
    pub schedule: DateTime<Utc>,
}

/// Who holds a run's lease and when they last renewed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: AgentId,
    pub renewed_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// A lease is active while `renewed_at + lease_seconds` is in the future.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, lease_seconds: u64) -> bool {
        let ttl = Duration::seconds(i64::try_from(lease_seconds).unwrap_or(i64::MAX));
        self.renewed_at
            .checked_add_signed(ttl)
            .is_none_or(|expires_at| expires_at > now)
    }
}

/// A free-text log line attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Truncates to the millisecond precision schedules are stored with.
pub(crate) fn schedule_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Operations the agent and the query facade need from durable storage.
#[async_trait]
pub trait Store: Send + Sync {
    /// Loads a run, creating an empty one if it does not exist.
    async fn create_or_get_run(&self, run_id: &RunId) -> Result<Run, StoreError>;

    /// Loads a run if it exists.
    async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError>;

    /// Replaces a run's stored log.
    async fn persist_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Adds a schedule entry, returning the due date it was recorded under.
    async fn add_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
        operation: Option<Operation>,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Closes a schedule entry. Closing an already closed entry is a no-op.
    async fn close_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reads the operation carried by an open schedule entry.
    ///
    /// Returns [`StoreError::ScheduleClosed`] if the entry is gone.
    async fn read_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
    ) -> Result<Option<Operation>, StoreError>;

    /// Earliest open entry due by now whose run is not in `exclude`.
    ///
    /// Entries due at the same instant come out in insertion order.
    async fn next_run(&self, queue: &str, exclude: &[RunId])
    -> Result<Option<NextRun>, StoreError>;

    /// Runs whose lease is still active.
    async fn active_leases(&self, lease_seconds: u64) -> Result<Vec<RunId>, StoreError>;

    /// Takes the lease if nobody holds an active one. Atomic: of two
    /// concurrent calls for the same run, at most one returns true.
    async fn acquire_lease(
        &self,
        run_id: &RunId,
        holder: AgentId,
        lease_seconds: u64,
    ) -> Result<bool, StoreError>;

    /// Extends a lease held by `holder`. Returns false if someone else holds it.
    async fn renew_lease(&self, run_id: &RunId, holder: AgentId) -> Result<bool, StoreError>;

    /// Drops a lease held by `holder`.
    async fn remove_lease(&self, run_id: &RunId, holder: AgentId) -> Result<(), StoreError>;

    /// Indexes a run under its workflow name.
    async fn write_workflow_link(&self, name: &str, run_id: &RunId) -> Result<(), StoreError>;

    /// Runs indexed under a workflow name.
    async fn read_workflow_links(&self, name: &str) -> Result<Vec<RunId>, StoreError>;

    async fn write_parent_child_link(&self, parent: &RunId, child: &RunId)
    -> Result<(), StoreError>;

    async fn read_children(&self, parent: &RunId) -> Result<Vec<RunId>, StoreError>;

    /// Appends a free-text line to a run's diagnostic log.
    async fn append_log(&self, run_id: &RunId, message: &str) -> Result<(), StoreError>;

    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, StoreError>;
}
