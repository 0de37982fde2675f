//! The capability every pooled execution unit provides.

use crate::error::PoolError;
use async_trait::async_trait;
use driftwood_core::WorkerId;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An isolated execution unit that accepts `M` messages and emits `E` events.
///
/// Implementations decide what isolation means: a dedicated thread, a task
/// on the host runtime, or a process on the other side of a message bus.
#[async_trait]
pub trait BaseWorker<M, E>: Send + Sync {
    /// Identity of this worker, stable for its lifetime.
    fn id(&self) -> WorkerId;

    /// Routes everything the worker emits to `sink`, replacing any earlier
    /// listener.
    fn listen(&self, sink: mpsc::UnboundedSender<E>);

    /// Delivers a message to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone.
    fn send(&self, message: M) -> Result<(), PoolError>;

    /// Terminates the worker. Called exactly once, by the pool.
    async fn destroy(&self);
}

/// A worker as the pool hands it out.
pub type PooledWorker<M, E> = Arc<dyn BaseWorker<M, E>>;

/// Creates workers on demand.
#[async_trait]
pub trait WorkerFactory<M, E>: Send + Sync {
    /// Creates a worker with the given identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution unit cannot be started.
    async fn create(&self, id: WorkerId) -> Result<PooledWorker<M, E>, PoolError>;
}
