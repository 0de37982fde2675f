//! The polling agent.
//!
//! Each tick takes the earliest due schedule entry whose run no agent holds a
//! lease on, leases the run, appends the entry's pending operation to the run
//! log and dispatches a replay to a worker. The replay's outcome is handled
//! asynchronously: a suspended run is rescheduled and keeps its lease, a
//! finished run gets its Stop recorded and loses its lease.
//!
//! A run is only ever replayed by the lease holder, and its next schedule
//! entry is written after the previous replay's outcome is persisted, so
//! replays of one run never overlap.

use crate::config::AgentConfig;
use crate::error::{AgentError, StoreError};
use crate::host::AgentHost;
use crate::manager::WorkflowWorkerManager;
use crate::service::Workflows;
use crate::store::{NextRun, Store};
use crate::worker::WorkflowPool;
use chrono::{DateTime, Utc};
use driftwood_core::{AgentId, Clock, RunId, SystemClock};
use driftwood_workflow::{
    DecisionPrefix, DeterminismCheck, FromWorker, Interrupt, OperationEvent, Run, StopResult,
    WorkflowRegistry,
};
use rootcause::prelude::Report;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// What one dispatch attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was due.
    Idle,
    /// Another agent took the lease or closed the schedule first.
    LostRace,
    /// This process is already replaying the run.
    AlreadyRunning,
    /// The run had already stopped; the schedule entry was discarded.
    Stale,
    /// A pending Stop was applied without a replay.
    Stopped(RunId),
    /// The run log is unbalanced; the schedule entry was discarded.
    Corrupted(RunId),
    /// The run log does not begin with Start; the schedule entry was discarded.
    MissingStart(RunId),
    /// The run names a workflow this agent does not have; it was failed.
    UnknownWorkflow(RunId),
    /// No worker could take the replay; the run stays due.
    WorkerUnavailable(RunId),
    /// A replay was sent to a worker.
    Dispatched(RunId),
}

/// Builds an [`Agent`].
pub struct AgentBuilder {
    store: Arc<dyn Store>,
    registry: Arc<WorkflowRegistry>,
    pool: Arc<WorkflowPool>,
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    determinism: Arc<dyn DeterminismCheck>,
    id: AgentId,
}

impl AgentBuilder {
    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for due dates, leases and recorded timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the default [`DecisionPrefix`] comparator.
    #[must_use]
    pub fn determinism(mut self, check: Arc<dyn DeterminismCheck>) -> Self {
        self.determinism = check;
        self
    }

    #[must_use]
    pub fn id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn build(self) -> Agent {
        let workflows = Workflows::new(self.store.clone(), self.clock.clone(), &self.config.queue)
            .with_registry(self.registry.clone());
        let manager = WorkflowWorkerManager::new(
            self.id,
            self.pool,
            Arc::new(AgentHost::new(workflows.clone())),
            self.clock.clone(),
        )
        .with_reply_timeout(self.config.reply_timeout());
        Agent {
            shared: Arc::new(Shared {
                id: self.id,
                config: self.config,
                store: self.store,
                registry: self.registry,
                clock: self.clock,
                determinism: self.determinism,
                manager,
                workflows,
            }),
            completions: Mutex::new(JoinSet::new()),
        }
    }
}

/// State shared between the tick and the completion handlers.
struct Shared {
    id: AgentId,
    config: AgentConfig,
    store: Arc<dyn Store>,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
    determinism: Arc<dyn DeterminismCheck>,
    manager: WorkflowWorkerManager,
    workflows: Workflows,
}

/// Polls one schedule queue and dispatches due runs to workers.
pub struct Agent {
    shared: Arc<Shared>,
    completions: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Starts building an agent with default config, the system clock and
    /// the [`DecisionPrefix`] comparator.
    #[must_use]
    pub fn builder(
        store: Arc<dyn Store>,
        registry: Arc<WorkflowRegistry>,
        pool: Arc<WorkflowPool>,
    ) -> AgentBuilder {
        AgentBuilder {
            store,
            registry,
            pool,
            config: AgentConfig::default(),
            clock: Arc::new(SystemClock),
            determinism: Arc::new(DecisionPrefix),
            id: AgentId::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> AgentId {
        self.shared.id
    }

    /// Facade for starting and inspecting runs on this agent's queue.
    #[must_use]
    pub fn workflows(&self) -> Workflows {
        self.shared.workflows.clone()
    }

    #[must_use]
    pub fn manager(&self) -> &WorkflowWorkerManager {
        &self.shared.manager
    }

    /// Makes up to `max_acquire_per_tick` dispatch attempts.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; the tick stops at the failure.
    #[instrument(skip(self), fields(agent_id = %self.shared.id, queue = %self.shared.config.queue))]
    pub async fn tick(&self) -> Result<Vec<TickOutcome>, Report<AgentError>> {
        let mut outcomes = Vec::new();
        for _ in 0..self.shared.config.max_acquire_per_tick.max(1) {
            let outcome = self.attempt().await?;
            let stop = matches!(
                outcome,
                TickOutcome::Idle | TickOutcome::WorkerUnavailable(_)
            );
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }

    async fn attempt(&self) -> Result<TickOutcome, Report<AgentError>> {
        let shared = &self.shared;
        let queue = shared.config.queue.as_str();
        let leased = shared
            .store
            .active_leases(shared.config.lease_seconds)
            .await
            .map_err(AgentError::Store)?;
        let Some(NextRun { run_id, schedule }) = shared
            .store
            .next_run(queue, &leased)
            .await
            .map_err(AgentError::Store)?
        else {
            return Ok(TickOutcome::Idle);
        };

        if !shared
            .store
            .acquire_lease(&run_id, shared.id, shared.config.lease_seconds)
            .await
            .map_err(AgentError::Store)?
        {
            debug!(%run_id, "lease taken by another agent");
            return Ok(TickOutcome::LostRace);
        }
        if shared.manager.is_running(&run_id) {
            debug!(%run_id, "run already in flight here");
            return Ok(TickOutcome::AlreadyRunning);
        }

        let mut run = shared
            .store
            .create_or_get_run(&run_id)
            .await
            .map_err(AgentError::Store)?;
        let pending = match shared.store.read_schedule(queue, &run_id, schedule).await {
            Ok(pending) => pending,
            Err(StoreError::ScheduleClosed { .. }) => {
                shared.release(&run_id).await?;
                return Ok(TickOutcome::LostRace);
            }
            Err(e) => return Err(AgentError::Store(e).into()),
        };

        match run.is_stopped() {
            Ok(true) => {
                debug!(%run_id, "discarding schedule of stopped run");
                shared.retire(&run_id, schedule).await?;
                return Ok(TickOutcome::Stale);
            }
            Ok(false) => {}
            Err(e) => return shared.corrupted(run_id, schedule, &e).await,
        }
        if let Some(operation) = pending {
            run.operations.push(operation);
        }
        match run.is_stopped() {
            Ok(true) => {
                shared.store.persist_run(&run).await.map_err(AgentError::Store)?;
                shared.retire(&run_id, schedule).await?;
                info!(%run_id, "run stopped by schedule");
                return Ok(TickOutcome::Stopped(run_id));
            }
            Ok(false) => {}
            Err(e) => return shared.corrupted(run_id, schedule, &e).await,
        }

        if let Err(e) = run.start_kwargs() {
            warn!(%run_id, error = %e, "discarding schedule of run without Start");
            shared.retire(&run_id, schedule).await?;
            return Ok(TickOutcome::MissingStart(run_id));
        }

        let Some(descriptor) = shared.registry.descriptor(run_id.workflow_name()).cloned() else {
            let message = format!("workflow {} is not registered", run_id.workflow_name());
            warn!(%run_id, "{message}");
            run.push(
                shared.clock.now(),
                OperationEvent::Stop {
                    result: StopResult::Err(json!(message)),
                },
            );
            shared.store.persist_run(&run).await.map_err(AgentError::Store)?;
            shared.retire(&run_id, schedule).await?;
            shared.note(&run_id, &message).await;
            return Ok(TickOutcome::UnknownWorkflow(run_id));
        };

        if let Err(e) = shared
            .manager
            .trigger_start(run.clone(), schedule, &descriptor, queue)
            .await
        {
            warn!(%run_id, error = %e, "no worker for run");
            shared.release(&run_id).await?;
            return Ok(TickOutcome::WorkerUnavailable(run_id));
        }
        let reply = shared.manager.listen(&run_id)?;
        debug!(%run_id, %schedule, "replay dispatched");

        let handler = self.shared.clone();
        self.completions
            .lock()
            .await
            .spawn(async move { handler.complete(run, schedule, reply).await });
        Ok(TickOutcome::Dispatched(run_id))
    }

    /// Waits for every dispatched replay's outcome to be recorded.
    pub async fn drain(&self) {
        let mut completions = self.completions.lock().await;
        while let Some(joined) = completions.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "completion handler panicked");
            }
        }
    }

    async fn reap(&self) {
        let mut completions = self.completions.lock().await;
        while let Some(joined) = completions.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "completion handler panicked");
            }
        }
    }

    /// Ticks every poll interval until `shutdown` turns true or its sender
    /// is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.shared.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(agent_id = %self.shared.id, queue = %self.shared.config.queue, "agent polling");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "tick failed");
                    }
                    self.reap().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(agent_id = %self.shared.id, "agent stopped polling");
    }

    /// Drains in-flight replays and shuts the worker pool down.
    pub async fn shutdown(&self) {
        self.drain().await;
        self.shared.manager.pool().shutdown().await;
        info!(agent_id = %self.shared.id, "agent shut down");
    }
}

impl Shared {
    /// Drops this agent's lease on `run_id`.
    async fn release(&self, run_id: &RunId) -> Result<(), Report<AgentError>> {
        Ok(self
            .store
            .remove_lease(run_id, self.id)
            .await
            .map_err(AgentError::Store)?)
    }

    /// Closes the schedule entry for good and drops the lease.
    async fn retire(&self, run_id: &RunId, schedule: DateTime<Utc>) -> Result<(), Report<AgentError>> {
        self.store
            .close_schedule(&self.config.queue, run_id, schedule)
            .await
            .map_err(AgentError::Store)?;
        self.release(run_id).await
    }

    /// Records a diagnostic line; failures are only logged.
    async fn note(&self, run_id: &RunId, message: &str) {
        if let Err(e) = self.store.append_log(run_id, message).await {
            warn!(%run_id, error = %e, "could not record run log line");
        }
    }

    async fn corrupted(
        &self,
        run_id: RunId,
        schedule: DateTime<Utc>,
        cause: &impl std::fmt::Display,
    ) -> Result<TickOutcome, Report<AgentError>> {
        error!(%run_id, error = %cause, "run log is corrupted");
        self.retire(&run_id, schedule).await?;
        self.note(&run_id, &format!("corrupted: {cause}")).await;
        Ok(TickOutcome::Corrupted(run_id))
    }

    /// Records the outcome of one replay. Never fails: anything that goes
    /// wrong is logged and the run is left for its lease to expire.
    async fn complete(
        self: Arc<Self>,
        old: Run,
        schedule: DateTime<Utc>,
        reply: oneshot::Receiver<FromWorker>,
    ) {
        let run_id = old.run_id.clone();
        let Ok(reply) = reply.await else {
            error!(%run_id, "worker went away without a final reply");
            self.note(&run_id, "worker went away without a final reply").await;
            self.manager.deallocate(&run_id, true).await;
            return;
        };

        let recorded = match reply {
            FromWorker::Interrupt { interrupt, run, .. } => {
                self.suspend(&old, run, interrupt, schedule).await
            }
            FromWorker::Success { result, run, .. } => {
                self.finish(&old, run, StopResult::Ok(result), schedule).await
            }
            FromWorker::Fail {
                error, exception, run, ..
            } => {
                if let Some(exception) = &exception {
                    warn!(%run_id, exception, error, "workflow failed abnormally");
                }
                self.finish(&old, run, StopResult::Err(json!(error)), schedule).await
            }
            FromWorker::Error { error } => {
                error!(%run_id, error, "worker error");
                self.note(&run_id, &format!("worker error: {error}")).await;
                self.manager.deallocate(&run_id, true).await;
                return;
            }
            FromWorker::Hostcall { op_name, .. } => {
                error!(%run_id, op_name, "hostcall where a final reply was expected");
                self.manager.deallocate(&run_id, true).await;
                return;
            }
        };
        if let Err(e) = recorded {
            error!(%run_id, error = %e, "failed to record replay outcome");
        }
        self.manager.deallocate(&run_id, false).await;
    }

    /// Fails the run on top of its old log if the replay diverged from it.
    ///
    /// Returns true if the run was failed.
    async fn diverged(
        &self,
        old: &Run,
        new: &Run,
        schedule: DateTime<Utc>,
    ) -> Result<bool, Report<AgentError>> {
        let Err(e) = self.determinism.compare(old, new) else {
            return Ok(false);
        };
        error!(run_id = %old.run_id, error = %e, "replay diverged from recorded history");
        let mut failed = old.clone();
        failed.push(
            self.clock.now(),
            OperationEvent::Stop {
                result: StopResult::Err(json!(e.to_string())),
            },
        );
        self.store.persist_run(&failed).await.map_err(AgentError::Store)?;
        self.retire(&old.run_id, schedule).await?;
        self.note(&old.run_id, &e.to_string()).await;
        Ok(true)
    }

    async fn suspend(
        &self,
        old: &Run,
        new: Run,
        interrupt: Interrupt,
        schedule: DateTime<Utc>,
    ) -> Result<(), Report<AgentError>> {
        if self.diverged(old, &new, schedule).await? {
            return Ok(());
        }
        let queue = &self.config.queue;
        self.store.persist_run(&new).await.map_err(AgentError::Store)?;
        self.store
            .close_schedule(queue, &new.run_id, schedule)
            .await
            .map_err(AgentError::Store)?;
        self.store
            .add_schedule(queue, &new.run_id, self.clock.now(), None)
            .await
            .map_err(AgentError::Store)?;
        if !self
            .store
            .renew_lease(&new.run_id, self.id)
            .await
            .map_err(AgentError::Store)?
        {
            warn!(run_id = %new.run_id, "lease was lost during replay");
        }
        debug!(run_id = %new.run_id, %interrupt, "run suspended");
        Ok(())
    }

    async fn finish(
        &self,
        old: &Run,
        mut new: Run,
        result: StopResult,
        schedule: DateTime<Utc>,
    ) -> Result<(), Report<AgentError>> {
        if self.diverged(old, &new, schedule).await? {
            return Ok(());
        }
        let ok = result.is_ok();
        new.push(self.clock.now(), OperationEvent::Stop { result });
        self.store.persist_run(&new).await.map_err(AgentError::Store)?;
        self.retire(&new.run_id, schedule).await?;
        info!(run_id = %new.run_id, ok, "run finished");
        Ok(())
    }
}
