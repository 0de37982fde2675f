//! The worker pool.
//!
//! State machine of a worker: created, idle, busy (lent to one owner), then
//! back to idle or destroyed. The pool state lives behind a std mutex that is
//! never held across an await; worker creation reserves its slot in `total`
//! before the factory is awaited so concurrent borrowers cannot overshoot
//! `max_workers`.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::queue::{FifoQueue, TimedQueue, WaitQueue, Waiter};
use crate::worker::{PooledWorker, WorkerFactory};
use driftwood_core::WorkerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// Point-in-time counts for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub total: usize,
    pub waiting: usize,
}

struct PoolState<M, E> {
    idle: Vec<PooledWorker<M, E>>,
    /// Lent workers and the owner each one is lent to.
    busy: HashMap<WorkerId, String>,
    /// Live workers plus creations in flight.
    total: usize,
    shutting_down: bool,
}

enum Plan<M, E> {
    Reuse(PooledWorker<M, E>),
    Create,
    Wait(oneshot::Receiver<PooledWorker<M, E>>),
}

/// A bounded pool of workers exchanging `M` and `E` messages.
pub struct WorkerPool<M, E> {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory<M, E>>,
    state: Mutex<PoolState<M, E>>,
    queue: Box<dyn WaitQueue<PooledWorker<M, E>>>,
}

impl<M, E> std::fmt::Debug for WorkerPool<M, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<M: Send + 'static, E: Send + 'static> WorkerPool<M, E> {
    /// Creates an empty pool.
    ///
    /// With a non-zero `wait_timeout_ms` the wait queue runs a timer task,
    /// so this must be called inside a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn WorkerFactory<M, E>>,
    ) -> Self {
        let queue: Box<dyn WaitQueue<PooledWorker<M, E>>> = if config.wait_timeout_ms == 0 {
            Box::new(FifoQueue::default())
        } else {
            Box::new(TimedQueue::new(Duration::from_millis(config.wait_timeout_ms)))
        };
        Self {
            name: name.into(),
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                busy: HashMap::new(),
                total: 0,
                shutting_down: false,
            }),
            queue,
        }
    }

    /// Name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState<M, E>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shut_down_error(&self) -> PoolError {
        PoolError::ShutDown {
            pool: self.name.clone(),
        }
    }

    /// Creates a worker for a slot already reserved in `total`.
    async fn create_reserved(&self) -> Result<PooledWorker<M, E>, PoolError> {
        let id = WorkerId::new();
        match self.factory.create(id).await {
            Ok(worker) => {
                debug!(pool = %self.name, worker_id = %worker.id(), "worker created");
                Ok(worker)
            }
            Err(e) => {
                self.state().total -= 1;
                warn!(pool = %self.name, error = %e, "worker creation failed");
                Err(e)
            }
        }
    }

    /// Lends a worker to `owner`.
    ///
    /// Reuses an idle worker, else creates one while under `max_workers`,
    /// else waits in FIFO order for one to be returned.
    ///
    /// # Errors
    ///
    /// Fails if the pool is shutting down, creation fails, or the wait
    /// timeout passes first.
    #[instrument(skip(self), fields(pool = %self.name))]
    pub async fn borrow_worker(&self, owner: &str) -> Result<PooledWorker<M, E>, PoolError> {
        let plan = {
            let mut state = self.state();
            if state.shutting_down {
                return Err(self.shut_down_error());
            }
            if let Some(worker) = state.idle.pop() {
                state.busy.insert(worker.id(), owner.to_string());
                Plan::Reuse(worker)
            } else if self.config.has_room(state.total) {
                state.total += 1;
                Plan::Create
            } else {
                let (tx, rx) = oneshot::channel();
                self.queue.push(Waiter::new(owner, tx));
                debug!(waiting = self.queue.len(), "pool exhausted, borrower parked");
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::Reuse(worker) => Ok(worker),
            Plan::Create => {
                let worker = self.create_reserved().await?;
                let abandoned = {
                    let mut state = self.state();
                    if state.shutting_down {
                        state.total -= 1;
                        true
                    } else {
                        state.busy.insert(worker.id(), owner.to_string());
                        false
                    }
                };
                if abandoned {
                    worker.destroy().await;
                    return Err(self.shut_down_error());
                }
                Ok(worker)
            }
            Plan::Wait(rx) => match rx.await {
                Ok(worker) => Ok(worker),
                Err(_) if self.state().shutting_down => Err(self.shut_down_error()),
                Err(_) => Err(PoolError::WaitTimeout {
                    pool: self.name.clone(),
                    timeout_ms: self.config.wait_timeout_ms,
                }),
            },
        }
    }

    /// Hands `worker` to the first live waiter, recording the new owner.
    ///
    /// Returns the worker if nobody is waiting.
    fn hand_off(
        &self,
        state: &mut PoolState<M, E>,
        mut worker: PooledWorker<M, E>,
    ) -> Option<PooledWorker<M, E>> {
        while let Some(waiter) = self.queue.pop() {
            let id = worker.id();
            match waiter.offer(worker) {
                Ok(owner) => {
                    debug!(pool = %self.name, worker_id = %id, %owner, "worker handed to waiter");
                    state.busy.insert(id, owner);
                    return None;
                }
                Err(returned) => worker = returned,
            }
        }
        Some(worker)
    }

    /// Returns a borrowed worker.
    ///
    /// The worker goes straight to the next waiter if there is one; otherwise
    /// it is destroyed if the pool is over its bound, or parked as idle.
    pub async fn unborrow_worker(&self, worker: PooledWorker<M, E>) {
        let surplus = {
            let mut state = self.state();
            state.busy.remove(&worker.id());
            if state.shutting_down {
                Some(worker)
            } else {
                match self.hand_off(&mut state, worker) {
                    None => None,
                    Some(worker) if self.config.is_over(state.total) => Some(worker),
                    Some(worker) => {
                        state.idle.push(worker);
                        None
                    }
                }
            }
        };
        if let Some(worker) = surplus {
            self.terminate(worker).await;
        }
    }

    async fn terminate(&self, worker: PooledWorker<M, E>) {
        let id = worker.id();
        {
            let mut state = self.state();
            state.busy.remove(&id);
            state.idle.retain(|w| w.id() != id);
            state.total = state.total.saturating_sub(1);
        }
        worker.destroy().await;
        debug!(pool = %self.name, worker_id = %id, "worker destroyed");
    }

    /// Destroys a worker that is broken or no longer wanted.
    ///
    /// Unless `shutdown` is set, the freed slot is used to serve the head of
    /// the wait queue with a fresh worker, or else to pre-warm toward
    /// `min_workers`.
    pub async fn destroy_worker(&self, worker: PooledWorker<M, E>, shutdown: bool) {
        self.terminate(worker).await;
        if shutdown {
            return;
        }
        if let Err(e) = self.replenish().await {
            warn!(pool = %self.name, error = %e, "could not replace destroyed worker");
        }
    }

    async fn replenish(&self) -> Result<(), PoolError> {
        let serve_waiter = {
            let mut state = self.state();
            if state.shutting_down || !self.config.has_room(state.total) {
                return Ok(());
            }
            if self.queue.is_empty() {
                false
            } else {
                state.total += 1;
                true
            }
        };
        if !serve_waiter {
            self.prewarm().await?;
            return Ok(());
        }

        let worker = self.create_reserved().await?;
        let leftover = {
            let mut state = self.state();
            self.hand_off(&mut state, worker)
        };
        if let Some(worker) = leftover {
            self.unborrow_worker(worker).await;
        }
        Ok(())
    }

    /// Creates idle workers until `min_workers` are live.
    ///
    /// Returns how many were created.
    ///
    /// # Errors
    ///
    /// Returns the first creation failure.
    pub async fn prewarm(&self) -> Result<usize, PoolError> {
        let mut created = 0;
        loop {
            {
                let mut state = self.state();
                if state.shutting_down
                    || state.total >= self.config.min_workers
                    || !self.config.has_room(state.total)
                {
                    return Ok(created);
                }
                state.total += 1;
            }
            let worker = self.create_reserved().await?;
            self.unborrow_worker(worker).await;
            created += 1;
        }
    }

    /// Stops lending, rejects every waiter and destroys idle workers.
    ///
    /// Busy workers are destroyed as they are returned.
    pub async fn shutdown(&self) {
        let idle = {
            let mut state = self.state();
            state.shutting_down = true;
            std::mem::take(&mut state.idle)
        };
        self.queue.clear();
        info!(pool = %self.name, idle = idle.len(), "pool shutting down");
        for worker in idle {
            self.terminate(worker).await;
        }
    }

    /// Current counts.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            idle: state.idle.len(),
            busy: state.busy.len(),
            total: state.total,
            waiting: self.queue.len(),
        }
    }

    /// Owner a worker is currently lent to.
    #[must_use]
    pub fn owner_of(&self, worker_id: WorkerId) -> Option<String> {
        self.state().busy.get(&worker_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::BaseWorker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct EchoWorker {
        id: WorkerId,
        sink: Mutex<Option<mpsc::UnboundedSender<u32>>>,
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BaseWorker<u32, u32> for EchoWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        fn listen(&self, sink: mpsc::UnboundedSender<u32>) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn send(&self, message: u32) -> Result<(), PoolError> {
            let sink = self.sink.lock().unwrap();
            let sink = sink.as_ref().ok_or_else(|| PoolError::Send {
                worker_id: self.id,
                message: "no listener".to_string(),
            })?;
            sink.send(message).map_err(|e| PoolError::Send {
                worker_id: self.id,
                message: e.to_string(),
            })
        }

        async fn destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct EchoFactory {
        created: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerFactory<u32, u32> for EchoFactory {
        async fn create(&self, id: WorkerId) -> Result<PooledWorker<u32, u32>, PoolError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoWorker {
                id,
                sink: Mutex::new(None),
                destroyed: self.destroyed.clone(),
            }))
        }
    }

    fn pool(config: PoolConfig) -> (Arc<WorkerPool<u32, u32>>, Arc<EchoFactory>) {
        let factory = Arc::new(EchoFactory::default());
        let pool = Arc::new(WorkerPool::new("test", config, factory.clone()));
        (pool, factory)
    }

    fn bounded(max_workers: usize, wait_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            min_workers: 0,
            max_workers,
            wait_timeout_ms,
        }
    }

    #[tokio::test]
    async fn workers_are_created_lazily_and_reused() {
        let (pool, factory) = pool(bounded(2, 0));
        assert_eq!(pool.stats().total, 0);

        let a = pool.borrow_worker("m1").await.unwrap();
        assert_eq!(pool.owner_of(a.id()).as_deref(), Some("m1"));
        let a_id = a.id();
        pool.unborrow_worker(a).await;
        assert_eq!(
            pool.stats(),
            PoolStats {
                idle: 1,
                busy: 0,
                total: 1,
                waiting: 0
            }
        );

        let again = pool.borrow_worker("m2").await.unwrap();
        assert_eq!(again.id(), a_id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn borrowed_worker_talks_to_listener() {
        let (pool, _) = pool(bounded(1, 0));
        let worker = pool.borrow_worker("m").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.listen(tx);
        worker.send(11).unwrap();
        assert_eq!(rx.recv().await, Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_blocks_until_release() {
        let (pool, factory) = pool(bounded(2, 0));
        let a = pool.borrow_worker("m").await.unwrap();
        let _b = pool.borrow_worker("m").await.unwrap();

        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.borrow_worker("late").await }
        });
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!waiting.is_finished());
        assert_eq!(pool.stats().waiting, 1);

        let a_id = a.id();
        pool.unborrow_worker(a).await;
        let handed = waiting.await.unwrap().unwrap();
        assert_eq!(handed.id(), a_id);
        assert_eq!(pool.owner_of(a_id).as_deref(), Some("late"));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_rejects() {
        let (pool, _) = pool(bounded(1, 250));
        let _held = pool.borrow_worker("m").await.unwrap();

        let started = tokio::time::Instant::now();
        let err = pool.borrow_worker("late").await.err().unwrap();
        assert!(matches!(err, PoolError::WaitTimeout { timeout_ms: 250, .. }));
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn destroyed_worker_is_replaced_for_waiter() {
        let (pool, factory) = pool(bounded(1, 0));
        let broken = pool.borrow_worker("m").await.unwrap();
        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.borrow_worker("next").await }
        });
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }

        let broken_id = broken.id();
        pool.destroy_worker(broken, false).await;
        let fresh = waiting.await.unwrap().unwrap();
        assert_ne!(fresh.id(), broken_id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn destroy_prewarms_to_minimum() {
        let (pool, factory) = pool(PoolConfig {
            min_workers: 1,
            max_workers: 4,
            wait_timeout_ms: 0,
        });
        let worker = pool.borrow_worker("m").await.unwrap();
        pool.destroy_worker(worker, false).await;
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prewarm_fills_minimum() {
        let (pool, _) = pool(PoolConfig {
            min_workers: 3,
            max_workers: 2,
            wait_timeout_ms: 0,
        });
        assert_eq!(pool.prewarm().await.unwrap(), 2);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.prewarm().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_waiters_and_destroys_idle() {
        let (pool, factory) = pool(bounded(1, 0));
        let held = pool.borrow_worker("m").await.unwrap();
        let spare = tokio::spawn({
            let pool = pool.clone();
            async move { pool.borrow_worker("late").await }
        });
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown().await;
        let err = spare.await.unwrap().err().unwrap();
        assert!(matches!(err, PoolError::ShutDown { .. }));
        assert!(matches!(
            pool.borrow_worker("after").await,
            Err(PoolError::ShutDown { .. })
        ));

        pool.unborrow_worker(held).await;
        assert_eq!(pool.stats().total, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unbounded_pool_never_waits() {
        let (pool, factory) = pool(bounded(0, 0));
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(pool.borrow_worker("m").await.unwrap());
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 20);
        assert_eq!(pool.stats().busy, 20);
    }
}
