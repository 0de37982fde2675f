//! Hostcalls and child workflow handles.
//!
//! Workflow code never touches the store directly. Anything that must reach
//! outside the replay (starting another run, signalling one) goes through a
//! [`Host`], which the worker proxies to the process that owns the store.

use crate::context::Context;
use crate::error::{HostcallError, WorkflowError};
use crate::operation::StopResult;
use async_trait::async_trait;
use driftwood_core::RunId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Start a new run, linked as a child of the caller.
pub const START_CHILD_WORKFLOW: &str = "start_child_workflow";
/// Report whether a run has stopped and with what result.
pub const CHILD_STATUS: &str = "child_status";
/// Stop a run.
pub const STOP_WORKFLOW: &str = "stop_workflow";
/// Deliver an event to a run.
pub const SEND_EVENT: &str = "send_event";

/// The side channel from a running workflow to its host.
#[async_trait]
pub trait Host: Send + Sync {
    /// Performs `op_name` with a JSON payload and returns the JSON response.
    ///
    /// # Errors
    ///
    /// Returns an error if the op is unknown, fails, or the host is gone.
    async fn hostcall(&self, op_name: &str, payload: JsonValue)
    -> Result<JsonValue, HostcallError>;
}

/// A host that supports no operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHost;

#[async_trait]
impl Host for NoHost {
    async fn hostcall(
        &self,
        op_name: &str,
        _payload: JsonValue,
    ) -> Result<JsonValue, HostcallError> {
        Err(HostcallError::Unsupported {
            op_name: op_name.to_string(),
        })
    }
}

/// Payload of [`START_CHILD_WORKFLOW`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartChildRequest {
    pub name: String,
    pub kwargs: JsonValue,
    pub parent: RunId,
}

/// Response of [`START_CHILD_WORKFLOW`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartChildResponse {
    pub run_id: RunId,
}

/// Payload of [`CHILD_STATUS`] and [`STOP_WORKFLOW`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRef {
    pub run_id: RunId,
}

/// Payload of [`SEND_EVENT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEventRequest {
    pub run_id: RunId,
    pub event_name: String,
    pub value: JsonValue,
}

/// Response of [`CHILD_STATUS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildStatus {
    pub stopped: bool,
    pub result: Option<StopResult>,
}

/// A reference to a child run that can be stored in a saved step.
///
/// The handle is created before the child starts so that `start` can run
/// inside `save` and the resulting run id is replayed instead of a second
/// child being spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowHandle {
    pub name: String,
    pub kwargs: JsonValue,
    pub run_id: Option<RunId>,
}

impl ChildWorkflowHandle {
    /// Starts the child if it has not been started.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the start.
    pub async fn start(&mut self, ctx: &Context) -> Result<RunId, WorkflowError> {
        if let Some(run_id) = &self.run_id {
            return Ok(run_id.clone());
        }
        let run_id = ctx
            .start_child_workflow(&self.name, self.kwargs.clone())
            .await?;
        self.run_id = Some(run_id.clone());
        Ok(run_id)
    }

    fn started(&self) -> Result<&RunId, WorkflowError> {
        self.run_id.as_ref().ok_or_else(|| {
            WorkflowError::failed(format!("child workflow '{}' was never started", self.name))
        })
    }

    /// Returns the child's status.
    ///
    /// # Errors
    ///
    /// Returns an error if the child was never started or the host fails.
    pub async fn status(&self, ctx: &Context) -> Result<ChildStatus, WorkflowError> {
        let run_id = self.started()?.clone();
        let response = ctx
            .hostcall(CHILD_STATUS, serde_json::to_value(RunRef { run_id })?)
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Returns true once the child has stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the child was never started or the host fails.
    pub async fn has_stopped(&self, ctx: &Context) -> Result<bool, WorkflowError> {
        Ok(self.status(ctx).await?.stopped)
    }

    /// Returns the child's final value.
    ///
    /// # Errors
    ///
    /// Fails if the child is still running, ended with an error, or its
    /// value does not decode as `T`.
    pub async fn result<T: DeserializeOwned>(&self, ctx: &Context) -> Result<T, WorkflowError> {
        let status = self.status(ctx).await?;
        match status.result {
            Some(StopResult::Ok(value)) if status.stopped => Ok(serde_json::from_value(value)?),
            Some(StopResult::Err(value)) if status.stopped => Err(WorkflowError::failed(
                format!("child workflow '{}' failed: {value}", self.name),
            )),
            _ => Err(WorkflowError::failed(format!(
                "child workflow '{}' has not stopped",
                self.name
            ))),
        }
    }

    /// Stops the child.
    ///
    /// # Errors
    ///
    /// Returns an error if the child was never started or the host fails.
    pub async fn stop(&self, ctx: &Context) -> Result<(), WorkflowError> {
        let run_id = self.started()?.clone();
        ctx.hostcall(STOP_WORKFLOW, serde_json::to_value(RunRef { run_id })?)
            .await?;
        Ok(())
    }

    /// Delivers an event to the child.
    ///
    /// # Errors
    ///
    /// Returns an error if the child was never started or the host fails.
    pub async fn send<T: Serialize>(
        &self,
        ctx: &Context,
        event_name: &str,
        value: T,
    ) -> Result<(), WorkflowError> {
        let request = SendEventRequest {
            run_id: self.started()?.clone(),
            event_name: event_name.to_string(),
            value: serde_json::to_value(value)?,
        };
        ctx.hostcall(SEND_EVENT, serde_json::to_value(request)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationEvent, Run};
    use chrono::Utc;
    use driftwood_core::ManualClock;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Records every call and answers from a fixed child run id.
    #[derive(Default)]
    struct ScriptedHost {
        calls: Mutex<Vec<(String, JsonValue)>>,
        child: Mutex<Option<RunId>>,
    }

    #[async_trait]
    impl Host for ScriptedHost {
        async fn hostcall(
            &self,
            op_name: &str,
            payload: JsonValue,
        ) -> Result<JsonValue, HostcallError> {
            self.calls
                .lock()
                .unwrap()
                .push((op_name.to_string(), payload.clone()));
            match op_name {
                START_CHILD_WORKFLOW => {
                    let request: StartChildRequest = serde_json::from_value(payload).unwrap();
                    let run_id = RunId::generate(&request.name).unwrap();
                    *self.child.lock().unwrap() = Some(run_id.clone());
                    Ok(serde_json::to_value(StartChildResponse { run_id }).unwrap())
                }
                CHILD_STATUS => Ok(serde_json::to_value(ChildStatus {
                    stopped: true,
                    result: Some(StopResult::Ok(json!(7))),
                })
                .unwrap()),
                STOP_WORKFLOW | SEND_EVENT => Ok(JsonValue::Null),
                other => Err(HostcallError::Unsupported {
                    op_name: other.to_string(),
                }),
            }
        }
    }

    fn context(host: Arc<ScriptedHost>) -> Context {
        let mut run = Run::new(RunId::generate("parent").unwrap());
        run.push(Utc::now(), OperationEvent::Start { kwargs: json!({}) });
        Context::builder(run, Arc::new(ManualClock::default()))
            .host(host)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn handle_starts_once_and_reads_result() {
        let host = Arc::new(ScriptedHost::default());
        let ctx = context(host.clone());
        let mut handle = ctx.create_workflow_handle("child", json!({"n": 1}));

        let first = handle.start(&ctx).await.unwrap();
        let second = handle.start(&ctx).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.workflow_name(), "child");

        assert!(handle.has_stopped(&ctx).await.unwrap());
        let value: i64 = handle.result(&ctx).await.unwrap();
        assert_eq!(value, 7);

        let calls = host.calls.lock().unwrap();
        let starts = calls
            .iter()
            .filter(|(op, _)| op == START_CHILD_WORKFLOW)
            .count();
        assert_eq!(starts, 1);
        assert_eq!(calls[0].1["parent"], json!(ctx.run_id().to_string()));
    }

    #[tokio::test]
    async fn unstarted_handle_cannot_be_signalled() {
        let ctx = context(Arc::new(ScriptedHost::default()));
        let handle = ctx.create_workflow_handle("child", json!(null));
        assert!(handle.stop(&ctx).await.is_err());
        assert!(handle.send(&ctx, "ping", 1).await.is_err());
    }

    #[tokio::test]
    async fn no_host_rejects_everything() {
        let err = NoHost
            .hostcall(START_CHILD_WORKFLOW, JsonValue::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, HostcallError::Unsupported { .. }));
    }
}
