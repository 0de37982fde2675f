//! Wait queues for borrowers of an exhausted pool.
//!
//! Both strategies are FIFO. [`FifoQueue`] waits forever. [`TimedQueue`]
//! rejects waiters whose deadline passes, using one timer task that is
//! re-armed to the head's deadline on every push and pop instead of one
//! timer per waiter. A rejected waiter is simply dropped from the queue,
//! which closes its channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// A parked borrower.
pub struct Waiter<W> {
    owner: String,
    tx: oneshot::Sender<W>,
    deadline: Option<Instant>,
}

impl<W> Waiter<W> {
    /// Parks `owner`; the worker is delivered through `tx`.
    #[must_use]
    pub fn new(owner: impl Into<String>, tx: oneshot::Sender<W>) -> Self {
        Self {
            owner: owner.into(),
            tx,
            deadline: None,
        }
    }

    /// Who is waiting.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns true if the borrower gave up waiting.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hands `worker` to the borrower, returning it if nobody is listening.
    ///
    /// # Errors
    ///
    /// Returns the worker if the borrower is gone.
    pub fn offer(self, worker: W) -> Result<String, W> {
        self.tx.send(worker).map(|()| self.owner)
    }
}

/// A FIFO of parked borrowers.
pub trait WaitQueue<W>: Send + Sync {
    /// Parks a borrower at the tail.
    fn push(&self, waiter: Waiter<W>);
    /// Removes the first borrower still waiting.
    fn pop(&self) -> Option<Waiter<W>>;
    /// Number of parked borrowers, including abandoned ones not yet swept.
    fn len(&self) -> usize;
    /// Returns true if nobody is parked.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Drops every parked borrower.
    fn clear(&self);
}

fn lock<W>(waiters: &Mutex<VecDeque<Waiter<W>>>) -> MutexGuard<'_, VecDeque<Waiter<W>>> {
    waiters.lock().unwrap_or_else(|e| e.into_inner())
}

fn pop_live<W>(waiters: &mut VecDeque<Waiter<W>>) -> Option<Waiter<W>> {
    while let Some(waiter) = waiters.pop_front() {
        if !waiter.is_abandoned() {
            return Some(waiter);
        }
    }
    None
}

/// Unbounded FIFO with no timer.
pub struct FifoQueue<W> {
    waiters: Mutex<VecDeque<Waiter<W>>>,
}

impl<W> Default for FifoQueue<W> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }
}

impl<W: Send> WaitQueue<W> for FifoQueue<W> {
    fn push(&self, waiter: Waiter<W>) {
        lock(&self.waiters).push_back(waiter);
    }

    fn pop(&self) -> Option<Waiter<W>> {
        pop_live(&mut lock(&self.waiters))
    }

    fn len(&self) -> usize {
        lock(&self.waiters).len()
    }

    fn clear(&self) {
        lock(&self.waiters).clear();
    }
}

struct Shared<W> {
    waiters: Mutex<VecDeque<Waiter<W>>>,
    head: watch::Sender<Option<Instant>>,
}

impl<W> Shared<W> {
    /// Points the timer at the current head's deadline.
    fn rearm(&self, waiters: &VecDeque<Waiter<W>>) {
        let deadline = waiters.front().and_then(|w| w.deadline);
        self.head.send_if_modified(|current| {
            if *current == deadline {
                false
            } else {
                *current = deadline;
                true
            }
        });
    }

    /// Drops every waiter whose deadline is at or before `now`.
    fn expire(&self, now: Instant) {
        let mut waiters = lock(&self.waiters);
        let mut expired = 0usize;
        while waiters
            .front()
            .is_some_and(|w| w.is_abandoned() || w.deadline.is_some_and(|d| d <= now))
        {
            waiters.pop_front();
            expired += 1;
        }
        if expired > 0 {
            debug!(expired, remaining = waiters.len(), "wait queue rejected expired borrowers");
        }
        self.rearm(&waiters);
    }
}

/// FIFO whose entries expire `timeout` after they were parked.
///
/// Must be created inside a tokio runtime; the timer task stops when the
/// queue is dropped.
pub struct TimedQueue<W> {
    shared: Arc<Shared<W>>,
    timeout: Duration,
    timer: JoinHandle<()>,
}

impl<W: Send + 'static> TimedQueue<W> {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (head, rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            waiters: Mutex::new(VecDeque::new()),
            head,
        });
        let timer = tokio::spawn(run_timer(shared.clone(), rx));
        Self {
            shared,
            timeout,
            timer,
        }
    }
}

async fn run_timer<W>(shared: Arc<Shared<W>>, mut head: watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *head.borrow_and_update();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => shared.expire(Instant::now()),
                    changed = head.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            None => {
                if head.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

impl<W: Send> WaitQueue<W> for TimedQueue<W> {
    fn push(&self, mut waiter: Waiter<W>) {
        waiter.deadline = Some(Instant::now() + self.timeout);
        let mut waiters = lock(&self.shared.waiters);
        waiters.push_back(waiter);
        self.shared.rearm(&waiters);
    }

    fn pop(&self) -> Option<Waiter<W>> {
        let mut waiters = lock(&self.shared.waiters);
        let waiter = pop_live(&mut waiters);
        self.shared.rearm(&waiters);
        waiter
    }

    fn len(&self) -> usize {
        lock(&self.shared.waiters).len()
    }

    fn clear(&self) {
        let mut waiters = lock(&self.shared.waiters);
        waiters.clear();
        self.shared.rearm(&waiters);
    }
}

impl<W> Drop for TimedQueue<W> {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
