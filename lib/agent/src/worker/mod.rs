//! Workflow workers and the transports that host them.
//!
//! Every transport runs the same worker loop
//! ([`driftwood_workflow::serve_worker`]); they differ only in where it runs
//! and how messages reach it. Each worker forwards everything the loop emits
//! to whichever listener the manager most recently attached.

mod inline;
mod remote;
mod thread;

pub use inline::InlineWorker;
pub use remote::{RemoteWorker, serve_remote_host};
pub use thread::ThreadWorker;

use async_trait::async_trait;
use driftwood_core::{Clock, WorkerId};
use driftwood_pool::{PoolError, PooledWorker, WorkerFactory, WorkerPool};
use driftwood_workflow::{FromWorker, ToWorker, WorkflowRegistry};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Name of the pool that hosts workflow workers.
pub const POOL_NAME: &str = "workflows";

/// A pooled workflow worker.
pub type WorkflowWorker = PooledWorker<ToWorker, FromWorker>;

/// The pool of workflow workers.
pub type WorkflowPool = WorkerPool<ToWorker, FromWorker>;

/// Where workers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A dedicated OS thread with its own runtime.
    #[default]
    Thread,
    /// A task on the agent's runtime.
    Inline,
    /// A worker host process reached over NATS.
    Remote,
}

/// The sink a worker's replies are routed to.
#[derive(Clone, Default)]
struct Listener(Arc<Mutex<Option<mpsc::UnboundedSender<FromWorker>>>>);

impl Listener {
    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<FromWorker>>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, sink: mpsc::UnboundedSender<FromWorker>) {
        *self.lock() = Some(sink);
    }

    fn forward(&self, worker_id: WorkerId, message: FromWorker) {
        let delivered = self
            .lock()
            .as_ref()
            .is_some_and(|sink| sink.send(message).is_ok());
        if !delivered {
            warn!(%worker_id, "worker reply dropped, nobody is listening");
        }
    }
}

/// Forwards everything from `replies` to the current listener.
fn spawn_relay(
    worker_id: WorkerId,
    listener: Listener,
    mut replies: mpsc::UnboundedReceiver<FromWorker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = replies.recv().await {
            listener.forward(worker_id, message);
        }
    })
}

fn send_error(worker_id: WorkerId) -> PoolError {
    PoolError::Send {
        worker_id,
        message: "worker inbox is closed".to_string(),
    }
}

enum Transport {
    Thread {
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
    },
    Inline {
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
    },
    Remote {
        client: async_nats::Client,
        prefix: String,
    },
}

/// Creates workflow workers of one transport kind.
pub struct WorkflowWorkerFactory {
    transport: Transport,
}

impl WorkflowWorkerFactory {
    /// Workers on dedicated threads, running bodies from `registry`.
    #[must_use]
    pub fn thread(registry: Arc<WorkflowRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport: Transport::Thread { registry, clock },
        }
    }

    /// Workers as tasks on the caller's runtime.
    #[must_use]
    pub fn inline(registry: Arc<WorkflowRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport: Transport::Inline { registry, clock },
        }
    }

    /// Workers hosted by [`serve_remote_host`] processes listening under
    /// `prefix`.
    #[must_use]
    pub fn remote(client: async_nats::Client, prefix: impl Into<String>) -> Self {
        Self {
            transport: Transport::Remote {
                client,
                prefix: prefix.into(),
            },
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self.transport {
            Transport::Thread { .. } => TransportKind::Thread,
            Transport::Inline { .. } => TransportKind::Inline,
            Transport::Remote { .. } => TransportKind::Remote,
        }
    }
}

#[async_trait]
impl WorkerFactory<ToWorker, FromWorker> for WorkflowWorkerFactory {
    async fn create(&self, id: WorkerId) -> Result<WorkflowWorker, PoolError> {
        let worker: WorkflowWorker = match &self.transport {
            Transport::Thread { registry, clock } => {
                Arc::new(ThreadWorker::spawn(id, registry.clone(), clock.clone())?)
            }
            Transport::Inline { registry, clock } => {
                Arc::new(InlineWorker::spawn(id, registry.clone(), clock.clone()))
            }
            Transport::Remote { client, prefix } => {
                Arc::new(RemoteWorker::attach(id, client.clone(), prefix).await?)
            }
        };
        Ok(worker)
    }
}
