//! Worker loop shared by every member of a pool

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, instrument, trace, warn};

use crate::retry::RetryPolicy;

use super::{Collector, DeadLetter, PoolCounters};

/// A queued task plus how many times it has been attempted so far
#[derive(Debug)]
pub(super) struct Envelope<T> {
    pub task: T,
    pub attempt: u32,
}

impl<T> Envelope<T> {
    pub fn new(task: T) -> Self {
        Self { task, attempt: 1 }
    }
}

pub(super) struct Worker<T, C> {
    pub id: usize,
    pub collector: Arc<C>,
    pub queue: Arc<Mutex<mpsc::Receiver<Envelope<T>>>>,
    pub requeue_tx: mpsc::Sender<Envelope<T>>,
    pub dead_letter_tx: mpsc::UnboundedSender<DeadLetter<T>>,
    pub retry: RetryPolicy,
    pub counters: Arc<PoolCounters>,
    pub cancel: CancellationToken,
    /// Marks the pool as stopped once the last worker drops it
    pub _done: Arc<DropGuard>,
}

impl<T, C> Worker<T, C>
where
    T: Clone + Send + Debug + 'static,
    C: Collector<T>,
{
    #[instrument(skip(self), fields(worker = self.id))]
    pub async fn run(self) {
        debug!("worker started");

        while let Some(envelope) = self.next().await {
            self.process(envelope).await;
        }

        debug!("worker stopped");
    }

    /// Take the next task, or `None` once the pool is cancelled
    async fn next(&self) -> Option<Envelope<T>> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            envelope = queue.recv() => envelope,
        }
    }

    async fn process(&self, envelope: Envelope<T>) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let err = match self.collector.collect(&envelope.task).await {
            Ok(()) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                trace!(task = ?envelope.task, attempt = envelope.attempt, "task succeeded");
                return;
            }
            Err(e) => e,
        };

        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        if !self.retry.allows_retry(envelope.attempt) {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            warn!(
                task = ?envelope.task,
                attempts = envelope.attempt,
                "task exhausted its attempts, dead-lettering: {err:#}"
            );
            let letter = DeadLetter {
                task: envelope.task,
                attempts: envelope.attempt,
                error: format!("{err:#}"),
            };
            if self.dead_letter_tx.send(letter).is_err() {
                warn!("dead-letter receiver dropped, task discarded");
            }
            return;
        }

        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        debug!(
            task = ?envelope.task,
            attempt = envelope.attempt,
            "task failed, requeueing: {err:#}"
        );
        self.requeue(envelope);
    }

    /// Put a failed task back on the queue without blocking this worker.
    ///
    /// The send waits for queue space like any producer, so a full queue
    /// delays the retry instead of stalling every worker.
    fn requeue(&self, envelope: Envelope<T>) {
        let delay = self.retry.delay_for(envelope.attempt);
        let tx = self.requeue_tx.clone();
        let cancel = self.cancel.clone();
        let next = Envelope {
            task: envelope.task,
            attempt: envelope.attempt + 1,
        };

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("pool stopped, requeue abandoned");
                }
                result = tx.send(next) => {
                    if result.is_err() {
                        trace!("queue closed, requeue abandoned");
                    }
                }
            }
        });
    }
}
