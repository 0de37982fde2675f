//! Run-to-worker bookkeeping.
//!
//! The manager translates run-oriented calls from the agent into pool and
//! worker calls: it borrows a worker for a run, sends it the START, pumps its
//! hostcalls to a [`HostcallHandler`] until the final reply, and gives the
//! worker back through the pool. Workers are never terminated directly.
//!
//! A worker that has not produced its final reply within the reply timeout
//! is presumed dead: the pump answers with a `FromWorker::Error` in its
//! place, which the agent handles by destroying the worker.

use crate::error::AgentError;
use crate::worker::{WorkflowPool, WorkflowWorker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftwood_core::{AgentId, Clock, RunId, WorkerId};
use driftwood_workflow::{
    FromWorker, HostcallError, Internal, Run, ToWorker, WorkflowDescriptor,
};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

/// Performs hostcalls on behalf of running workflows.
#[async_trait]
pub trait HostcallHandler: Send + Sync {
    /// Handles `op_name` for the run `caller`.
    ///
    /// # Errors
    ///
    /// Returns an error the worker passes back to the workflow body.
    async fn handle(
        &self,
        caller: &RunId,
        op_name: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, HostcallError>;
}

/// A run currently assigned to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub run_id: RunId,
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
}

struct Assignment {
    worker: WorkflowWorker,
    descriptor: WorkflowDescriptor,
    started_at: DateTime<Utc>,
    replies: Option<mpsc::UnboundedReceiver<FromWorker>>,
}

#[derive(Default)]
struct ManagerState {
    runs: HashMap<RunId, Assignment>,
    by_name: HashMap<String, HashSet<RunId>>,
}

/// Maps runs to the workers replaying them.
pub struct WorkflowWorkerManager {
    agent_id: AgentId,
    pool: Arc<WorkflowPool>,
    hostcalls: Arc<dyn HostcallHandler>,
    clock: Arc<dyn Clock>,
    reply_timeout: Duration,
    state: Mutex<ManagerState>,
}

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

impl WorkflowWorkerManager {
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        pool: Arc<WorkflowPool>,
        hostcalls: Arc<dyn HostcallHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agent_id,
            pool,
            hostcalls,
            clock,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Sets how long a run's worker may take to produce its final reply.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The pool workers are borrowed from.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkflowPool> {
        &self.pool
    }

    /// Borrows a worker for `run` and sends it the START.
    ///
    /// May wait for a worker if the pool is exhausted.
    ///
    /// # Errors
    ///
    /// Fails if no worker can be borrowed or the START cannot be delivered.
    /// In the latter case the worker is destroyed.
    #[instrument(skip(self, run, descriptor), fields(run_id = %run.run_id))]
    pub async fn trigger_start(
        &self,
        run: Run,
        schedule: DateTime<Utc>,
        descriptor: &WorkflowDescriptor,
        queue: &str,
    ) -> Result<(), Report<AgentError>> {
        let run_id = run.run_id.clone();
        let worker = self
            .pool
            .borrow_worker(&run_id.to_string())
            .await
            .map_err(AgentError::Pool)?;
        let (sink, replies) = mpsc::unbounded_channel();
        worker.listen(sink);

        let start = ToWorker::Start {
            module_path: descriptor.module_path.clone(),
            function_name: descriptor.function_name.clone(),
            run,
            schedule,
            internal: Internal {
                agent_id: self.agent_id.to_string(),
                queue: queue.to_string(),
            },
        };
        if let Err(e) = worker.send(start) {
            self.pool.destroy_worker(worker, false).await;
            return Err(AgentError::WorkerGone {
                run_id,
                details: e.to_string(),
            }
            .into());
        }

        debug!(worker_id = %worker.id(), workflow = %descriptor.name, "start sent");
        let mut state = self.state();
        state
            .by_name
            .entry(descriptor.name.clone())
            .or_default()
            .insert(run_id.clone());
        state.runs.insert(
            run_id,
            Assignment {
                worker,
                descriptor: descriptor.clone(),
                started_at: self.clock.now(),
                replies: Some(replies),
            },
        );
        Ok(())
    }

    /// Attaches the reply handler for a started run.
    ///
    /// Hostcalls are answered as they arrive; the returned receiver resolves
    /// with the final reply. It is cancelled if the worker goes away first,
    /// and resolves with `FromWorker::Error` if the reply timeout passes.
    ///
    /// # Errors
    ///
    /// Fails if the run has no worker here or is already being listened to.
    pub fn listen(&self, run_id: &RunId) -> Result<oneshot::Receiver<FromWorker>, Report<AgentError>> {
        let (worker, mut replies) = {
            let mut state = self.state();
            let assignment = state
                .runs
                .get_mut(run_id)
                .ok_or_else(|| AgentError::NotRunning {
                    run_id: run_id.clone(),
                })?;
            let replies = assignment
                .replies
                .take()
                .ok_or_else(|| AgentError::NotRunning {
                    run_id: run_id.clone(),
                })?;
            (assignment.worker.clone(), replies)
        };

        let (done, final_reply) = oneshot::channel();
        let hostcalls = self.hostcalls.clone();
        let run_id = run_id.clone();
        let timeout = self.reply_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        tokio::spawn(async move {
            loop {
                let message = match tokio::time::timeout_at(deadline, replies.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(_) => {
                        warn!(%run_id, ?timeout, "worker gave no final reply in time");
                        let _ = done.send(FromWorker::Error {
                            error: format!("no final reply within {timeout:?}"),
                        });
                        return;
                    }
                };
                let (id, op_name, json) = match message {
                    FromWorker::Hostcall { id, op_name, json } => (id, op_name, json),
                    reply => {
                        let _ = done.send(reply);
                        return;
                    }
                };
                debug!(%run_id, op_name, hostcall_id = id, "hostcall");
                let response = match hostcalls.handle(&run_id, &op_name, json).await {
                    Ok(result) => ToWorker::HostcallResp {
                        id,
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => ToWorker::HostcallResp {
                        id,
                        result: None,
                        error: Some(e.to_string()),
                    },
                };
                if let Err(e) = worker.send(response) {
                    warn!(%run_id, error = %e, "could not answer hostcall");
                    return;
                }
            }
            debug!(%run_id, "worker replies closed before a final reply");
        });
        Ok(final_reply)
    }

    /// Gives the run's worker back to the pool, destroying it if `destroy`.
    pub async fn deallocate(&self, run_id: &RunId, destroy: bool) {
        let assignment = {
            let mut state = self.state();
            let assignment = state.runs.remove(run_id);
            if let Some(assignment) = &assignment
                && let Some(runs) = state.by_name.get_mut(&assignment.descriptor.name)
            {
                runs.remove(run_id);
                if runs.is_empty() {
                    state.by_name.remove(&assignment.descriptor.name);
                }
            }
            assignment
        };
        let Some(assignment) = assignment else {
            return;
        };
        if destroy {
            self.pool.destroy_worker(assignment.worker, false).await;
        } else {
            self.pool.unborrow_worker(assignment.worker).await;
        }
    }

    /// Returns true if this process has a worker replaying `run_id`.
    #[must_use]
    pub fn is_running(&self, run_id: &RunId) -> bool {
        self.state().runs.contains_key(run_id)
    }

    /// Runs of workflow `name` currently on a worker, oldest first.
    #[must_use]
    pub fn active_runs(&self, name: &str) -> Vec<ActiveRun> {
        let state = self.state();
        let mut runs: Vec<ActiveRun> = state
            .by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|run_id| {
                state.runs.get(run_id).map(|assignment| ActiveRun {
                    run_id: run_id.clone(),
                    worker_id: assignment.worker.id(),
                    started_at: assignment.started_at,
                })
            })
            .collect();
        runs.sort_by_key(|run| run.started_at);
        runs
    }
}
