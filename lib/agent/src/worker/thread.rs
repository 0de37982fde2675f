//! Workers on dedicated OS threads.
//!
//! Each worker owns a thread running a current-thread runtime, so a body
//! that blocks or spins only stalls its own worker.

use super::{Listener, send_error, spawn_relay};
use async_trait::async_trait;
use driftwood_core::{Clock, WorkerId};
use driftwood_pool::{BaseWorker, PoolError};
use driftwood_workflow::{FromWorker, ToWorker, WorkflowRegistry, serve_worker};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A worker loop on its own thread.
pub struct ThreadWorker {
    id: WorkerId,
    inbox: Mutex<Option<mpsc::UnboundedSender<ToWorker>>>,
    listener: Listener,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    relay: JoinHandle<()>,
}

impl ThreadWorker {
    /// Starts the thread. Must be called inside a tokio runtime, which hosts
    /// the reply relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn spawn(
        id: WorkerId,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        let (inbox, to_worker) = mpsc::unbounded_channel();
        let (outbox, replies) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name(format!("driftwood-{id}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build();
                match runtime {
                    Ok(runtime) => runtime.block_on(serve_worker(registry, clock, to_worker, outbox)),
                    Err(e) => {
                        let _ = outbox.send(FromWorker::Error {
                            error: format!("worker runtime failed to start: {e}"),
                        });
                    }
                }
            })
            .map_err(|e| PoolError::Create {
                pool: super::POOL_NAME.to_string(),
                message: e.to_string(),
            })?;
        let listener = Listener::default();
        let relay = spawn_relay(id, listener.clone(), replies);
        Ok(Self {
            id,
            inbox: Mutex::new(Some(inbox)),
            listener,
            thread: Mutex::new(Some(handle)),
            relay,
        })
    }
}

#[async_trait]
impl BaseWorker<ToWorker, FromWorker> for ThreadWorker {
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
        // Closing the inbox ends the worker loop, which ends the thread.
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(worker_id = %self.id, "worker thread did not exit cleanly");
            }
        }
        self.relay.abort();
        debug!(worker_id = %self.id, "thread worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::{registry, start_add};
    use driftwood_core::ManualClock;
    use serde_json::json;

    #[tokio::test]
    async fn replays_on_its_own_thread() {
        let worker =
            ThreadWorker::spawn(WorkerId::new(), registry(), Arc::new(ManualClock::default())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.listen(tx);
        worker.send(start_add()).unwrap();
        match rx.recv().await.unwrap() {
            FromWorker::Success { result, .. } => assert_eq!(result, json!(5)),
            other => panic!("unexpected reply: {other:?}"),
        }
        worker.destroy().await;
        assert!(worker.send(start_add()).is_err());
    }

    #[tokio::test]
    async fn listener_can_be_replaced() {
        let worker =
            ThreadWorker::spawn(WorkerId::new(), registry(), Arc::new(ManualClock::default())).unwrap();
        let (first, mut first_rx) = mpsc::unbounded_channel();
        let (second, mut second_rx) = mpsc::unbounded_channel();
        worker.listen(first);
        worker.listen(second);
        worker.send(start_add()).unwrap();
        assert!(second_rx.recv().await.is_some());
        assert!(first_rx.try_recv().is_err());
        worker.destroy().await;
    }
}
