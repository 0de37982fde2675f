//! Workers hosted by another process, reached over NATS.
//!
//! Subjects, under a shared prefix:
//!
//! - `<prefix>.attach`: request/reply; the payload is the worker id. A host
//!   answers once the worker loop is running.
//! - `<prefix>.<worker>.in`: [`ToWorker`] messages, JSON encoded.
//! - `<prefix>.<worker>.out`: [`FromWorker`] messages, JSON encoded.
//! - `<prefix>.<worker>.detach`: ends the worker.

use super::{Listener, send_error};
use async_trait::async_trait;
use driftwood_core::{Clock, WorkerId};
use driftwood_pool::{BaseWorker, PoolError};
use driftwood_workflow::{FromWorker, ToWorker, WorkflowRegistry, serve_worker};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue group worker hosts share, so each attach lands on exactly one host.
const HOST_QUEUE_GROUP: &str = "driftwood-worker-hosts";

fn attach_subject(prefix: &str) -> String {
    format!("{prefix}.attach")
}

fn worker_subject(prefix: &str, worker: &str, direction: &str) -> String {
    format!("{prefix}.{worker}.{direction}")
}

fn create_error(message: impl std::fmt::Display) -> PoolError {
    PoolError::Create {
        pool: super::POOL_NAME.to_string(),
        message: message.to_string(),
    }
}

/// The agent-side handle to a worker in another process.
pub struct RemoteWorker {
    id: WorkerId,
    client: async_nats::Client,
    prefix: String,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ToWorker>>>,
    listener: Listener,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteWorker {
    /// Asks a worker host to start a worker with this id.
    ///
    /// # Errors
    ///
    /// Returns an error if no host answers or the subscription fails.
    pub async fn attach(
        id: WorkerId,
        client: async_nats::Client,
        prefix: &str,
    ) -> Result<Self, PoolError> {
        let worker = id.to_string();
        // Subscribe before attaching so no reply can be missed.
        let mut replies = client
            .subscribe(worker_subject(prefix, &worker, "out"))
            .await
            .map_err(create_error)?;
        client
            .request(attach_subject(prefix), worker.clone().into())
            .await
            .map_err(|e| create_error(format!("no worker host answered: {e}")))?;

        let listener = Listener::default();
        let reader = {
            let listener = listener.clone();
            tokio::spawn(async move {
                while let Some(message) = replies.next().await {
                    match serde_json::from_slice::<FromWorker>(&message.payload) {
                        Ok(reply) => listener.forward(id, reply),
                        Err(e) => warn!(worker_id = %id, error = %e, "undecodable worker reply"),
                    }
                }
            })
        };

        let (outgoing, mut to_worker) = mpsc::unbounded_channel::<ToWorker>();
        let writer = {
            let client = client.clone();
            let subject = worker_subject(prefix, &worker, "in");
            tokio::spawn(async move {
                while let Some(message) = to_worker.recv().await {
                    let bytes = match serde_json::to_vec(&message) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(worker_id = %id, error = %e, "unencodable worker message");
                            continue;
                        }
                    };
                    if let Err(e) = client.publish(subject.clone(), bytes.into()).await {
                        warn!(worker_id = %id, error = %e, "failed to publish to worker");
                    }
                }
            })
        };

        debug!(worker_id = %id, prefix, "remote worker attached");
        Ok(Self {
            id,
            client,
            prefix: prefix.to_string(),
            outgoing: Mutex::new(Some(outgoing)),
            listener,
            tasks: vec![reader, writer],
        })
    }
}

#[async_trait]
impl BaseWorker<ToWorker, FromWorker> for RemoteWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn listen(&self, sink: mpsc::UnboundedSender<FromWorker>) {
        self.listener.set(sink);
    }

    fn send(&self, message: ToWorker) -> Result<(), PoolError> {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .ok_or_else(|| send_error(self.id))?
            .send(message)
            .map_err(|_| send_error(self.id))
    }

    async fn destroy(&self) {
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).take();
        let subject = worker_subject(&self.prefix, &self.id.to_string(), "detach");
        if let Err(e) = self.client.publish(subject, Vec::<u8>::new().into()).await {
            warn!(worker_id = %self.id, error = %e, "failed to detach remote worker");
        }
        for task in &self.tasks {
            task.abort();
        }
        debug!(worker_id = %self.id, "remote worker detached");
    }
}

/// Hosts workers for agents that attach under `prefix`, until the
/// connection closes.
///
/// # Errors
///
/// Returns an error if the attach subscription cannot be created.
pub async fn serve_remote_host(
    client: async_nats::Client,
    prefix: String,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
) -> Result<(), PoolError> {
    let mut attaches = client
        .queue_subscribe(attach_subject(&prefix), HOST_QUEUE_GROUP.to_string())
        .await
        .map_err(create_error)?;
    info!(prefix, "worker host listening");

    while let Some(request) = attaches.next().await {
        let worker = String::from_utf8_lossy(&request.payload).into_owned();
        let Some(reply) = request.reply else {
            warn!(worker, "attach without a reply subject ignored");
            continue;
        };
        match host_worker(&client, &prefix, &worker, registry.clone(), clock.clone()).await {
            Ok(()) => {
                if let Err(e) = client.publish(reply, Vec::<u8>::new().into()).await {
                    warn!(worker, error = %e, "failed to acknowledge attach");
                }
            }
            Err(e) => warn!(worker, error = %e, "failed to host worker"),
        }
    }
    info!(prefix, "worker host stopped");
    Ok(())
}

/// Starts one worker loop wired to its subjects.
async fn host_worker(
    client: &async_nats::Client,
    prefix: &str,
    worker: &str,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
) -> Result<(), async_nats::SubscribeError> {
    let mut incoming = client.subscribe(worker_subject(prefix, worker, "in")).await?;
    let mut detach = client.subscribe(worker_subject(prefix, worker, "detach")).await?;
    let (inbox, to_worker) = mpsc::unbounded_channel();
    let (outbox, mut replies) = mpsc::unbounded_channel::<FromWorker>();
    let serve = tokio::spawn(serve_worker(registry, clock, to_worker, outbox));

    let out_subject = worker_subject(prefix, worker, "out");
    let client = client.clone();
    let worker = worker.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = incoming.next() => {
                    let Some(message) = message else { break };
                    match serde_json::from_slice::<ToWorker>(&message.payload) {
                        Ok(message) => {
                            if inbox.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(worker, error = %e, "undecodable message for worker"),
                    }
                }
                reply = replies.recv() => {
                    let Some(reply) = reply else { break };
                    match serde_json::to_vec(&reply) {
                        Ok(bytes) => {
                            if let Err(e) = client.publish(out_subject.clone(), bytes.into()).await {
                                warn!(worker, error = %e, "failed to publish worker reply");
                            }
                        }
                        Err(e) => warn!(worker, error = %e, "unencodable worker reply"),
                    }
                }
                _ = detach.next() => break,
            }
        }
        serve.abort();
        debug!(worker, "hosted worker stopped");
    });
    Ok(())
}
