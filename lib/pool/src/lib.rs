//! Bounded pool of isolated execution units.
//!
//! The pool knows nothing about workflows. It lends out anything that
//! implements [`BaseWorker`] (a message sink with a listener and a
//! destructor), creates workers lazily through a [`WorkerFactory`], and
//! parks borrowers in a FIFO wait queue once `max_workers` are live.

pub mod config;
pub mod error;
pub mod pool;
pub mod queue;
pub mod worker;

pub use config::PoolConfig;
pub use error::PoolError;
pub use pool::{PoolStats, WorkerPool};
pub use queue::{FifoQueue, TimedQueue, WaitQueue, Waiter};
pub use worker::{BaseWorker, PooledWorker, WorkerFactory};
