//! Hostcalls answered by the agent.

use crate::manager::HostcallHandler;
use crate::service::Workflows;
use async_trait::async_trait;
use driftwood_core::RunId;
use driftwood_workflow::child::{
    CHILD_STATUS, RunRef, SEND_EVENT, START_CHILD_WORKFLOW, STOP_WORKFLOW, SendEventRequest,
    StartChildRequest, StartChildResponse,
};
use driftwood_workflow::{ChildStatus, HostcallError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::info;

/// Performs child workflow and signalling hostcalls against the store.
#[derive(Debug, Clone)]
pub struct AgentHost {
    workflows: Workflows,
}

impl AgentHost {
    #[must_use]
    pub fn new(workflows: Workflows) -> Self {
        Self { workflows }
    }
}

fn rejected(op_name: &str, e: impl std::fmt::Display) -> HostcallError {
    HostcallError::Rejected {
        op_name: op_name.to_string(),
        message: e.to_string(),
    }
}

fn decode<T: DeserializeOwned>(op_name: &str, payload: JsonValue) -> Result<T, HostcallError> {
    serde_json::from_value(payload).map_err(|e| rejected(op_name, e))
}

fn encode<T: Serialize>(op_name: &str, value: &T) -> Result<JsonValue, HostcallError> {
    serde_json::to_value(value).map_err(|e| rejected(op_name, e))
}

impl AgentHost {
    async fn start_child(
        &self,
        caller: &RunId,
        request: StartChildRequest,
    ) -> Result<JsonValue, HostcallError> {
        if &request.parent != caller {
            return Err(rejected(
                START_CHILD_WORKFLOW,
                format!("{caller} cannot start children of {}", request.parent),
            ));
        }
        let child = self
            .workflows
            .start(&request.name, request.kwargs)
            .await
            .map_err(|e| rejected(START_CHILD_WORKFLOW, e))?;
        self.workflows
            .store()
            .write_parent_child_link(caller, &child)
            .await
            .map_err(|e| rejected(START_CHILD_WORKFLOW, e))?;
        info!(parent = %caller, %child, "child run started");
        encode(START_CHILD_WORKFLOW, &StartChildResponse { run_id: child })
    }

    async fn child_status(&self, run_id: &RunId) -> Result<JsonValue, HostcallError> {
        let run = self
            .workflows
            .retrieve_events(run_id)
            .await
            .map_err(|e| rejected(CHILD_STATUS, e))?;
        let status = match run {
            Some(run) if run.is_stopped().map_err(|e| rejected(CHILD_STATUS, e))? => ChildStatus {
                stopped: true,
                result: run.last_stop().map(|(result, _)| result.clone()),
            },
            _ => ChildStatus {
                stopped: false,
                result: None,
            },
        };
        encode(CHILD_STATUS, &status)
    }
}

#[async_trait]
impl HostcallHandler for AgentHost {
    async fn handle(
        &self,
        caller: &RunId,
        op_name: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, HostcallError> {
        match op_name {
            START_CHILD_WORKFLOW => self.start_child(caller, decode(op_name, payload)?).await,
            CHILD_STATUS => {
                let RunRef { run_id } = decode(op_name, payload)?;
                self.child_status(&run_id).await
            }
            STOP_WORKFLOW => {
                let RunRef { run_id } = decode(op_name, payload)?;
                let stopped = self
                    .workflows
                    .stop(&run_id)
                    .await
                    .map_err(|e| rejected(op_name, e))?;
                encode(op_name, &stopped)
            }
            SEND_EVENT => {
                let SendEventRequest {
                    run_id,
                    event_name,
                    value,
                } = decode(op_name, payload)?;
                self.workflows
                    .send(&run_id, &event_name, value)
                    .await
                    .map_err(|e| rejected(op_name, e))?;
                Ok(JsonValue::Null)
            }
            _ => Err(HostcallError::Unsupported {
                op_name: op_name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use chrono::Utc;
    use driftwood_core::{Clock, ManualClock};
    use driftwood_workflow::{OperationEvent, Run, StopResult};
    use serde_json::json;
    use std::sync::Arc;

    fn host() -> (AgentHost, Arc<MemoryStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (AgentHost::new(Workflows::new(store.clone(), clock, "default")), store)
    }

    #[tokio::test]
    async fn child_start_links_parent() {
        let (host, store) = host();
        let parent = RunId::generate("parent").unwrap();
        let request = json!({"name": "child", "kwargs": {"n": 1}, "parent": parent});
        let response = host.handle(&parent, START_CHILD_WORKFLOW, request).await.unwrap();
        let StartChildResponse { run_id } = serde_json::from_value(response).unwrap();
        assert_eq!(run_id.workflow_name(), "child");
        assert_eq!(store.read_children(&parent).await.unwrap(), vec![run_id]);
    }

    #[tokio::test]
    async fn child_start_for_another_parent_is_rejected() {
        let (host, _store) = host();
        let caller = RunId::generate("parent").unwrap();
        let other = RunId::generate("parent").unwrap();
        let request = json!({"name": "child", "kwargs": null, "parent": other});
        assert!(matches!(
            host.handle(&caller, START_CHILD_WORKFLOW, request).await,
            Err(HostcallError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn status_reports_stop_result() {
        let (host, store) = host();
        let caller = RunId::generate("parent").unwrap();
        let child = RunId::generate("child").unwrap();
        let pending = host
            .handle(&caller, CHILD_STATUS, json!({"run_id": child}))
            .await
            .unwrap();
        assert_eq!(pending, json!({"stopped": false, "result": null}));

        let mut run = Run::new(child.clone());
        run.push(Utc::now(), OperationEvent::Start { kwargs: json!(null) });
        run.push(Utc::now(), OperationEvent::Stop { result: StopResult::Ok(json!(9)) });
        store.persist_run(&run).await.unwrap();
        let status: ChildStatus = serde_json::from_value(
            host.handle(&caller, CHILD_STATUS, json!({"run_id": child}))
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(status.stopped);
        assert_eq!(status.result, Some(StopResult::Ok(json!(9))));
    }

    #[tokio::test]
    async fn unknown_ops_are_unsupported() {
        let (host, _store) = host();
        let caller = RunId::generate("parent").unwrap();
        assert!(matches!(
            host.handle(&caller, "launch_missiles", json!(null)).await,
            Err(HostcallError::Unsupported { .. })
        ));
    }
}
