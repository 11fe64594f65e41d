//! Bounded worker pool with self-driven retry
//!
//! ```text
//! send(task) ──► [bounded queue] ──► worker × N ──► collector.collect(&task)
//!                      ↑                                 │
//!                      └──────── requeue on Err ◄────────┤
//!                                                        └─► dead letter (attempt budget spent)
//! ```
//!
//! With the default [`RetryPolicy`] a failing task is requeued immediately and
//! forever, so no task is dropped on failure. A permanently failing task keeps
//! cycling through the queue; configure `max_attempts` to route it to the
//! dead-letter channel instead.

pub mod error;
mod worker;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::RetryPolicy;

pub use error::{PoolError, PoolResult};
use worker::{Envelope, Worker};

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 100;

/// The action a pool runs for every task
#[async_trait]
pub trait Collector<T>: Send + Sync + 'static {
    async fn collect(&self, task: &T) -> Result<()>;
}

#[async_trait]
impl<T, C> Collector<T> for Arc<C>
where
    T: Sync + 'static,
    C: Collector<T> + ?Sized,
{
    async fn collect(&self, task: &T) -> Result<()> {
        (**self).collect(task).await
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Queue capacity; `send` waits once this many tasks are queued
    pub capacity: usize,

    /// Number of workers draining the queue
    pub workers: usize,

    pub retry: RetryPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            workers: 1,
            retry: RetryPolicy::unbounded(),
        }
    }
}

/// A task that ran out of attempts
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter<T> {
    pub task: T,
    pub attempts: u32,
    /// Error chain of the last failed attempt
    pub error: String,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    attempts: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl PoolStats {
    /// Tasks neither succeeded nor dead-lettered yet
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.succeeded)
            .saturating_sub(self.dead_lettered)
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Start `options.workers` workers running `collector`.
    ///
    /// Returns the handle used to submit tasks and the dead-letter receiver.
    /// Dead letters only occur when `options.retry` bounds the attempts.
    pub fn spawn<T, C>(
        collector: C,
        options: PoolOptions,
    ) -> (PoolHandle<T>, mpsc::UnboundedReceiver<DeadLetter<T>>)
    where
        T: Clone + Send + Sync + Debug + 'static,
        C: Collector<T>,
    {
        let (queue_tx, queue_rx) = mpsc::channel(options.capacity.max(1));
        let (dead_letter_tx, dead_letter_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(queue_rx));
        let collector = Arc::new(collector);
        let counters = Arc::new(PoolCounters::default());
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let done_guard = Arc::new(done.clone().drop_guard());

        let workers = options.workers.max(1);
        debug!(workers, capacity = options.capacity, retry = ?options.retry, "starting worker pool");

        for id in 0..workers {
            let worker = Worker {
                id,
                collector: collector.clone(),
                queue: queue.clone(),
                requeue_tx: queue_tx.clone(),
                dead_letter_tx: dead_letter_tx.clone(),
                retry: options.retry,
                counters: counters.clone(),
                cancel: cancel.clone(),
                _done: done_guard.clone(),
            };
            tokio::spawn(worker.run());
        }

        let handle = PoolHandle {
            queue_tx,
            counters,
            cancel,
            done,
        };

        (handle, dead_letter_rx)
    }
}

/// Handle for submitting tasks to a running pool
pub struct PoolHandle<T> {
    queue_tx: mpsc::Sender<Envelope<T>>,
    counters: Arc<PoolCounters>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        Self {
            queue_tx: self.queue_tx.clone(),
            counters: self.counters.clone(),
            cancel: self.cancel.clone(),
            done: self.done.clone(),
        }
    }
}

impl<T: Send + Debug + 'static> PoolHandle<T> {
    /// Queue `task`, waiting while the queue is full.
    ///
    /// Fails with [`PoolError::Stopped`] once the pool is shut down, also when
    /// the caller is parked on a full queue at that moment.
    pub async fn send(&self, task: T) -> PoolResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::Stopped);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PoolError::Stopped),
            result = self.queue_tx.send(Envelope::new(task)) => {
                result.map_err(|_| PoolError::Stopped)?;
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Tasks currently waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Stop the workers after their current task and release parked senders
    pub fn shutdown(&self) {
        debug!("shutting down worker pool");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until every worker has exited
    pub async fn join(&self) {
        self.done.cancelled().await;
    }
}
