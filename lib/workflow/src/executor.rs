//! Worker-side execution of START messages.
//!
//! Every transport runs the same loop: read [`ToWorker`] messages, replay the
//! requested workflow against the run it was given, and write exactly one
//! final [`FromWorker`] reply per start. Hostcalls made by the body are sent
//! out as `HOSTCALL` messages and resumed when the matching `HOSTCALL_RESP`
//! comes back.

use crate::child::Host;
use crate::context::Context;
use crate::error::{HostcallError, WorkflowError};
use crate::interrupt::Outcome;
use crate::operation::Run;
use crate::registry::{WorkflowFn, WorkflowRegistry};
use crate::wire::{FromWorker, ToWorker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftwood_core::Clock;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Runs the body, turning a panic into its message.
async fn run_body(
    body: WorkflowFn,
    ctx: Context,
) -> Result<Result<JsonValue, WorkflowError>, String> {
    let kwargs = ctx.kwargs().clone();
    AssertUnwindSafe(body(ctx, kwargs))
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(&*panic))
}

/// Any interrupt raised during the replay wins over the body's own return
/// value. A panic in the body is a failure.
fn classify(ctx: &Context, result: Result<Result<JsonValue, WorkflowError>, String>) -> Outcome {
    if let Some(interrupt) = ctx.raised_interrupt() {
        return Outcome::Suspended(interrupt);
    }
    match result {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(WorkflowError::Interrupted(interrupt))) => Outcome::Suspended(interrupt),
        Ok(Err(WorkflowError::Failed { message })) => Outcome::Failed(message),
        Err(panic) => Outcome::Failed(format!("workflow panicked: {panic}")),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Everything needed to run one START.
pub struct StartRequest {
    pub module_path: String,
    pub function_name: String,
    pub run: Run,
    pub schedule: DateTime<Utc>,
}

/// Runs one START and builds the final reply.
pub async fn execute_start(
    registry: &WorkflowRegistry,
    clock: Arc<dyn Clock>,
    host: Arc<dyn Host>,
    request: StartRequest,
) -> FromWorker {
    let StartRequest {
        module_path,
        function_name,
        run,
        schedule,
    } = request;

    let Some(body) = registry.get(&module_path, &function_name) else {
        return FromWorker::Fail {
            error: format!("workflow {module_path}::{function_name} is not registered"),
            exception: Some("not_found".to_string()),
            run,
            schedule,
        };
    };
    let ctx = match Context::builder(run.clone(), clock).host(host).build() {
        Ok(ctx) => ctx,
        Err(e) => {
            return FromWorker::Fail {
                error: e.to_string(),
                exception: Some("corrupted".to_string()),
                run,
                schedule,
            };
        }
    };

    let result = run_body(body, ctx.clone()).await;
    let panicked = result.is_err();
    let outcome = classify(&ctx, result);
    let run = ctx.finish();
    match outcome {
        Outcome::Completed(result) => FromWorker::Success {
            result,
            run,
            schedule,
        },
        Outcome::Suspended(interrupt) => FromWorker::Interrupt {
            interrupt,
            run,
            schedule,
        },
        Outcome::Failed(error) => FromWorker::Fail {
            exception: panicked.then(|| "panic".to_string()),
            error,
            run,
            schedule,
        },
    }
}

type HostcallReply = oneshot::Sender<Result<JsonValue, HostcallError>>;
type PendingCalls = HashMap<u64, (String, HostcallReply)>;

/// A [`Host`] that forwards calls over the worker's outbound channel.
#[derive(Clone)]
pub struct ChannelHost {
    outbox: mpsc::UnboundedSender<FromWorker>,
    pending: Arc<Mutex<PendingCalls>>,
    next_id: Arc<AtomicU64>,
}

impl ChannelHost {
    #[must_use]
    pub fn new(outbox: mpsc::UnboundedSender<FromWorker>) -> Self {
        Self {
            outbox,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resumes the hostcall waiting on `id`.
    pub fn resolve(&self, id: u64, result: Option<JsonValue>, error: Option<String>) {
        let Some((op_name, tx)) = self.pending().remove(&id) else {
            warn!(hostcall_id = id, "response for unknown hostcall");
            return;
        };
        let response = match error {
            Some(message) => Err(HostcallError::Rejected { op_name, message }),
            None => Ok(result.unwrap_or(JsonValue::Null)),
        };
        let _ = tx.send(response);
    }
}

#[async_trait]
impl Host for ChannelHost {
    async fn hostcall(
        &self,
        op_name: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, HostcallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, (op_name.to_string(), tx));
        let sent = self.outbox.send(FromWorker::Hostcall {
            id,
            op_name: op_name.to_string(),
            json: payload,
        });
        if sent.is_err() {
            self.pending().remove(&id);
            return Err(HostcallError::Disconnected);
        }
        rx.await.map_err(|_| HostcallError::Disconnected)?
    }
}

/// Serves START messages from `inbox` until it closes.
///
/// Each START runs on its own task so hostcall responses can be routed
/// while a body is waiting on one.
pub async fn serve_worker(
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
    mut inbox: mpsc::UnboundedReceiver<ToWorker>,
    outbox: mpsc::UnboundedSender<FromWorker>,
) {
    let host = ChannelHost::new(outbox.clone());
    while let Some(message) = inbox.recv().await {
        match message {
            ToWorker::Start {
                module_path,
                function_name,
                run,
                schedule,
                internal,
            } => {
                debug!(run_id = %run.run_id, agent_id = %internal.agent_id, "worker starting replay");
                let registry = registry.clone();
                let clock = clock.clone();
                let host = host.clone();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let request = StartRequest {
                        module_path,
                        function_name,
                        run,
                        schedule,
                    };
                    let reply = execute_start(&registry, clock, Arc::new(host), request).await;
                    let _ = outbox.send(reply);
                });
            }
            ToWorker::HostcallResp { id, result, error } => host.resolve(id, result, error),
        }
    }
    debug!("worker inbox closed");
}
