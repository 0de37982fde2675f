//! Workers that run as tasks on the agent's own runtime.

use super::{Listener, send_error, spawn_relay};
use async_trait::async_trait;
use driftwood_core::{Clock, WorkerId};
use driftwood_pool::{BaseWorker, PoolError};
use driftwood_workflow::{FromWorker, ToWorker, WorkflowRegistry, serve_worker};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A worker loop spawned on the current runtime. No isolation beyond panic
/// capture.
pub struct InlineWorker {
    id: WorkerId,
    inbox: Mutex<Option<mpsc::UnboundedSender<ToWorker>>>,
    listener: Listener,
    tasks: Vec<JoinHandle<()>>,
}

impl InlineWorker {
    /// Spawns the loop. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(id: WorkerId, registry: Arc<WorkflowRegistry>, clock: Arc<dyn Clock>) -> Self {
        let (inbox, to_worker) = mpsc::unbounded_channel();
        let (outbox, replies) = mpsc::unbounded_channel();
        let listener = Listener::default();
        let serve = tokio::spawn(serve_worker(registry, clock, to_worker, outbox));
        let relay = spawn_relay(id, listener.clone(), replies);
        Self {
            id,
            inbox: Mutex::new(Some(inbox)),
            listener,
            tasks: vec![serve, relay],
        }
    }
}

#[async_trait]
impl BaseWorker<ToWorker, FromWorker> for InlineWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn listen(&self, sink: mpsc::UnboundedSender<FromWorker>) {
        self.listener.set(sink);
    }

    fn send(&self, message: ToWorker) -> Result<(), PoolError> {
        self.inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .ok_or_else(|| send_error(self.id))?
            .send(message)
            .map_err(|_| send_error(self.id))
    }

    async fn destroy(&self) {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        for task in &self.tasks {
            task.abort();
        }
        debug!(worker_id = %self.id, "inline worker stopped");
    }
}
