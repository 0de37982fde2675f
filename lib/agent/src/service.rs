//! The query-facing surface: start, signal, stop and inspect runs.
//!
//! Every operation here only writes schedule entries and links; the agent
//! loop does the rest when those entries come due.

use crate::error::AgentError;
use crate::store::{LogEntry, Store};
use chrono::{DateTime, Utc};
use driftwood_core::{Clock, RunId};
use driftwood_workflow::{Operation, OperationEvent, Run, StopResult, WorkflowRegistry};
use rootcause::prelude::Report;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Error value recorded when a run is stopped from outside.
pub const STOPPED_MESSAGE: &str = "workflow stopped";

/// How a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Completed,
    CompletedWithError,
}

/// A run that has stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedRun {
    pub run_id: RunId,
    pub status: CompletionStatus,
    pub value: JsonValue,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

/// Runs of one workflow, split by whether they have stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowResults {
    pub ongoing: Vec<RunId>,
    pub completed: Vec<CompletedRun>,
}

/// Handle for starting and inspecting runs.
#[derive(Clone)]
pub struct Workflows {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    queue: String,
    registry: Option<Arc<WorkflowRegistry>>,
}

impl std::fmt::Debug for Workflows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflows")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Workflows {
    /// Creates a facade that schedules onto `queue`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, queue: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            queue: queue.into(),
            registry: None,
        }
    }

    /// Rejects starts of workflows missing from `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<WorkflowRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Adds a schedule entry for `run_id`, optionally carrying an event to
    /// append when it comes due. Returns the recorded due date.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn schedule(
        &self,
        run_id: &RunId,
        due: DateTime<Utc>,
        event: Option<OperationEvent>,
    ) -> Result<DateTime<Utc>, Report<AgentError>> {
        let operation = event.map(|event| Operation::new(self.clock.now(), event));
        Ok(self
            .store
            .add_schedule(&self.queue, run_id, due, operation)
            .await
            .map_err(AgentError::Store)?)
    }

    /// Indexes `run_id` under workflow `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn link(&self, name: &str, run_id: &RunId) -> Result<(), Report<AgentError>> {
        Ok(self
            .store
            .write_workflow_link(name, run_id)
            .await
            .map_err(AgentError::Store)?)
    }

    /// Runs indexed under workflow `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn retrieve_links(&self, name: &str) -> Result<Vec<RunId>, Report<AgentError>> {
        Ok(self
            .store
            .read_workflow_links(name)
            .await
            .map_err(AgentError::Store)?)
    }

    /// The stored log of a run, if the run exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn retrieve_events(&self, run_id: &RunId) -> Result<Option<Run>, Report<AgentError>> {
        Ok(self.store.read_run(run_id).await.map_err(AgentError::Store)?)
    }

    /// Starts a run of workflow `name` and returns its id right away.
    ///
    /// # Errors
    ///
    /// Fails if the workflow is unknown, the name cannot form a run id, or
    /// the kwargs are not JSON.
    #[instrument(skip(self, kwargs), fields(queue = %self.queue))]
    pub async fn start<K: Serialize>(
        &self,
        name: &str,
        kwargs: K,
    ) -> Result<RunId, Report<AgentError>> {
        if let Some(registry) = &self.registry
            && !registry.contains(name)
        {
            return Err(AgentError::UnknownWorkflow {
                name: name.to_string(),
            }
            .into());
        }
        let run_id = RunId::generate(name).map_err(|e| AgentError::InvalidWorkflowName {
            name: name.to_string(),
            reason: e.reason,
        })?;
        let kwargs = serde_json::to_value(kwargs).map_err(|e| AgentError::InvalidPayload {
            details: format!("kwargs of {name}: {e}"),
        })?;

        self.schedule(&run_id, self.clock.now(), Some(OperationEvent::Start { kwargs }))
            .await?;
        self.link(name, &run_id).await?;
        info!(%run_id, "run scheduled");
        Ok(run_id)
    }

    async fn require_known(&self, run_id: &RunId) -> Result<(), Report<AgentError>> {
        if self
            .retrieve_links(run_id.workflow_name())
            .await?
            .contains(run_id)
        {
            Ok(())
        } else {
            Err(AgentError::RunNotFound {
                run_id: run_id.clone(),
            }
            .into())
        }
    }

    /// Delivers an event to a run. The run sees it on its next replay.
    ///
    /// # Errors
    ///
    /// Fails if the run is unknown or the value is not JSON.
    #[instrument(skip(self, value), fields(run_id = %run_id))]
    pub async fn send<T: Serialize>(
        &self,
        run_id: &RunId,
        event_name: &str,
        value: T,
    ) -> Result<(), Report<AgentError>> {
        self.require_known(run_id).await?;
        let value = serde_json::to_value(value).map_err(|e| AgentError::InvalidPayload {
            details: format!("event {event_name}: {e}"),
        })?;
        self.schedule(
            run_id,
            self.clock.now(),
            Some(OperationEvent::Send {
                event_name: event_name.to_string(),
                value,
            }),
        )
        .await?;
        Ok(())
    }

    /// Stops a run with an error result.
    ///
    /// Returns false without scheduling anything if the run already stopped.
    ///
    /// # Errors
    ///
    /// Fails if the run is unknown.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn stop(&self, run_id: &RunId) -> Result<bool, Report<AgentError>> {
        self.require_known(run_id).await?;
        if let Some(run) = self.retrieve_events(run_id).await?
            && run.is_stopped().map_err(AgentError::Journal)?
        {
            return Ok(false);
        }
        self.schedule(
            run_id,
            self.clock.now(),
            Some(OperationEvent::Stop {
                result: StopResult::Err(json!(STOPPED_MESSAGE)),
            }),
        )
        .await?;
        info!("stop scheduled");
        Ok(true)
    }

    /// Every run of workflow `name`, split into ongoing and completed.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails.
    pub async fn results(&self, name: &str) -> Result<WorkflowResults, Report<AgentError>> {
        let mut results = WorkflowResults::default();
        for run_id in self.retrieve_links(name).await? {
            let Some(run) = self.retrieve_events(&run_id).await? else {
                results.ongoing.push(run_id);
                continue;
            };
            match run.is_stopped() {
                Ok(true) => {}
                Ok(false) => {
                    results.ongoing.push(run_id);
                    continue;
                }
                Err(e) => {
                    warn!(%run_id, error = %e, "skipping corrupted run");
                    continue;
                }
            }
            let Some((result, ended_at)) = run.last_stop() else {
                continue;
            };
            results.completed.push(CompletedRun {
                status: if result.is_ok() {
                    CompletionStatus::Completed
                } else {
                    CompletionStatus::CompletedWithError
                },
                value: result.value().clone(),
                started_at: run.started_at(),
                ended_at,
                run_id,
            });
        }
        Ok(results)
    }

    /// The stored log of a run.
    ///
    /// # Errors
    ///
    /// Fails if the run does not exist yet.
    pub async fn events(&self, run_id: &RunId) -> Result<Run, Report<AgentError>> {
        self.retrieve_events(run_id)
            .await?
            .ok_or_else(|| {
                AgentError::RunNotFound {
                    run_id: run_id.clone(),
                }
                .into()
            })
    }

    /// Runs started as children of `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn children(&self, run_id: &RunId) -> Result<Vec<RunId>, Report<AgentError>> {
        Ok(self
            .store
            .read_children(run_id)
            .await
            .map_err(AgentError::Store)?)
    }

    /// Diagnostic lines the agent recorded for `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, Report<AgentError>> {
        Ok(self.store.read_logs(run_id).await.map_err(AgentError::Store)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use driftwood_core::ManualClock;

    fn workflows() -> (Workflows, Arc<MemoryStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (Workflows::new(store.clone(), clock, "default"), store)
    }

    #[tokio::test]
    async fn start_schedules_and_links() {
        let (workflows, store) = workflows();
        let run_id = workflows.start("add", json!({"a": 1})).await.unwrap();
        assert_eq!(run_id.workflow_name(), "add");
        assert_eq!(workflows.retrieve_links("add").await.unwrap(), vec![run_id.clone()]);
        assert_eq!(store.open_schedules("default"), 1);

        let results = workflows.results("add").await.unwrap();
        assert_eq!(results.ongoing, vec![run_id]);
        assert!(results.completed.is_empty());
    }

    #[tokio::test]
    async fn registry_rejects_unknown_names() {
        let (workflows, _store) = workflows();
        let workflows = workflows.with_registry(Arc::new(WorkflowRegistry::new()));
        assert!(workflows.start("missing", json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let (workflows, _store) = workflows();
        assert!(workflows.start("has space", json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn send_and_stop_need_a_known_run() {
        let (workflows, _store) = workflows();
        let ghost = RunId::generate("ghost").unwrap();
        assert!(workflows.send(&ghost, "ping", 1).await.is_err());
        assert!(workflows.stop(&ghost).await.is_err());
    }

    #[tokio::test]
    async fn stopping_a_stopped_run_is_a_no_op() {
        let (workflows, store) = workflows();
        let run_id = workflows.start("add", json!(null)).await.unwrap();
        let mut run = Run::new(run_id.clone());
        run.push(Utc::now(), OperationEvent::Start { kwargs: json!(null) });
        run.push(Utc::now(), OperationEvent::Stop { result: StopResult::Ok(json!(1)) });
        store.persist_run(&run).await.unwrap();

        assert!(!workflows.stop(&run_id).await.unwrap());
        let results = workflows.results("add").await.unwrap();
        assert_eq!(results.completed.len(), 1);
        assert_eq!(results.completed[0].status, CompletionStatus::Completed);
        assert_eq!(results.completed[0].value, json!(1));
    }
}
