//! In-process store for tests and single-agent deployments.

use super::{LeaseRecord, LogEntry, NextRun, Store, schedule_precision};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use driftwood_core::{AgentId, Clock, RunId};
use driftwood_workflow::{Operation, Run};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct ScheduleRow {
    queue: String,
    run_id: RunId,
    due: DateTime<Utc>,
    seq: u64,
    operation: Option<Operation>,
}

#[derive(Debug, Default)]
struct State {
    runs: HashMap<RunId, Run>,
    /// Open schedule entries only; closing removes the row.
    schedules: Vec<ScheduleRow>,
    next_seq: u64,
    leases: HashMap<RunId, LeaseRecord>,
    workflow_links: HashMap<String, Vec<RunId>>,
    children: HashMap<RunId, Vec<RunId>>,
    logs: HashMap<RunId, Vec<LogEntry>>,
}

impl State {
    fn open_row(&self, queue: &str, run_id: &RunId, due: DateTime<Utc>) -> Option<usize> {
        self.schedules
            .iter()
            .position(|row| row.queue == queue && &row.run_id == run_id && row.due == due)
    }
}

/// A [`Store`] kept in memory. Leases and due dates are judged by the
/// injected clock.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of open schedule entries in `queue`.
    #[must_use]
    pub fn open_schedules(&self, queue: &str) -> usize {
        self.state()
            .schedules
            .iter()
            .filter(|row| row.queue == queue)
            .count()
    }

    /// The current lease record for a run, if any.
    #[must_use]
    pub fn lease(&self, run_id: &RunId) -> Option<LeaseRecord> {
        self.state().leases.get(run_id).copied()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_or_get_run(&self, run_id: &RunId) -> Result<Run, StoreError> {
        Ok(self
            .state()
            .runs
            .entry(run_id.clone())
            .or_insert_with(|| Run::new(run_id.clone()))
            .clone())
    }

    async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.state().runs.get(run_id).cloned())
    }

    async fn persist_run(&self, run: &Run) -> Result<(), StoreError> {
        self.state().runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn add_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
        operation: Option<Operation>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut state = self.state();
        let mut due = schedule_precision(due);
        while state.open_row(queue, run_id, due).is_some() {
            due += Duration::milliseconds(1);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.schedules.push(ScheduleRow {
            queue: queue.to_string(),
            run_id: run_id.clone(),
            due,
            seq,
            operation,
        });
        Ok(due)
    }

    async fn close_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(index) = state.open_row(queue, run_id, schedule_precision(due)) {
            state.schedules.remove(index);
        }
        Ok(())
    }

    async fn read_schedule(
        &self,
        queue: &str,
        run_id: &RunId,
        due: DateTime<Utc>,
    ) -> Result<Option<Operation>, StoreError> {
        let state = self.state();
        state
            .open_row(queue, run_id, schedule_precision(due))
            .map(|index| state.schedules[index].operation.clone())
            .ok_or_else(|| StoreError::ScheduleClosed {
                run_id: run_id.clone(),
            })
    }

    async fn next_run(
        &self,
        queue: &str,
        exclude: &[RunId],
    ) -> Result<Option<NextRun>, StoreError> {
        let now = self.clock.now();
        let state = self.state();
        Ok(state
            .schedules
            .iter()
            .filter(|row| row.queue == queue && row.due <= now && !exclude.contains(&row.run_id))
            .min_by_key(|row| (row.due, row.seq))
            .map(|row| NextRun {
                run_id: row.run_id.clone(),
                schedule: row.due,
            }))
    }

    async fn active_leases(&self, lease_seconds: u64) -> Result<Vec<RunId>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .state()
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_active(now, lease_seconds))
            .map(|(run_id, _)| run_id.clone())
            .collect())
    }

    async fn acquire_lease(
        &self,
        run_id: &RunId,
        holder: AgentId,
        lease_seconds: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state();
        if state
            .leases
            .get(run_id)
            .is_some_and(|lease| lease.is_active(now, lease_seconds))
        {
            return Ok(false);
        }
        state.leases.insert(
            run_id.clone(),
            LeaseRecord {
                holder,
                renewed_at: now,
            },
        );
        Ok(true)
    }

    async fn renew_lease(&self, run_id: &RunId, holder: AgentId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state();
        match state.leases.get_mut(run_id) {
            Some(lease) if lease.holder == holder => {
                lease.renewed_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_lease(&self, run_id: &RunId, holder: AgentId) -> Result<(), StoreError> {
        let mut state = self.state();
        if state
            .leases
            .get(run_id)
            .is_some_and(|lease| lease.holder == holder)
        {
            state.leases.remove(run_id);
        }
        Ok(())
    }

    async fn write_workflow_link(&self, name: &str, run_id: &RunId) -> Result<(), StoreError> {
        let mut state = self.state();
        let links = state.workflow_links.entry(name.to_string()).or_default();
        if !links.contains(run_id) {
            links.push(run_id.clone());
        }
        Ok(())
    }

    async fn read_workflow_links(&self, name: &str) -> Result<Vec<RunId>, StoreError> {
        Ok(self
            .state()
            .workflow_links
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_parent_child_link(
        &self,
        parent: &RunId,
        child: &RunId,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let children = state.children.entry(parent.clone()).or_default();
        if !children.contains(child) {
            children.push(child.clone());
        }
        Ok(())
    }

    async fn read_children(&self, parent: &RunId) -> Result<Vec<RunId>, StoreError> {
        Ok(self
            .state()
            .children
            .get(parent)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_log(&self, run_id: &RunId, message: &str) -> Result<(), StoreError> {
        let at = self.clock.now();
        self.state()
            .logs
            .entry(run_id.clone())
            .or_default()
            .push(LogEntry {
                at,
                message: message.to_string(),
            });
        Ok(())
    }

    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.state().logs.get(run_id).cloned().unwrap_or_default())
    }
}
