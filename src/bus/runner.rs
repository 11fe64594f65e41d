//! Consumer group runner - turns handler results into acks and nacks
//!
//! One runner drives one `(topic, group, handler)` triple:
//!
//! ```text
//! subscription ──► handler.handle(&message) ──┬─ Ok  ──► ack
//!                                             ├─ Err ──► nack (bus redelivers)
//!                                             └─ Err(MalformedPayload) ──► reject
//!     ↑
//!     └─── Commands (GetStats) / cancellation
//! ```
//!
//! Handler errors never leave the runner. A redelivered message is handed out
//! again before anything newer, so a malformed payload would come back
//! forever and hold up the group. Handlers flag such errors with
//! [`MalformedPayload`] and the runner rejects them instead.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{BusResult, Delivery, Message, MessageBus, Subscription};

/// Handler error for a payload that can never be processed
///
/// Messages failing with this error are rejected: counted as nacked, never
/// redelivered.
#[derive(Debug)]
pub struct MalformedPayload {
    message_id: String,
    source: anyhow::Error,
}

impl MalformedPayload {
    pub fn new(message: &Message, source: impl Into<anyhow::Error>) -> Self {
        Self {
            message_id: message.id.clone(),
            source: source.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl fmt::Display for MalformedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed payload in message {}", self.message_id)
    }
}

impl std::error::Error for MalformedPayload {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// Business logic bound to one consumer group
///
/// The runner owns its handler exclusively, so `handle` may mutate state
/// without further synchronization.
#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(&mut self, message: &Message) -> Result<()>;
}

/// Adapter returned by [`handler_fn`]
pub struct FnHandler<F>(F);

/// Use an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&mut self, message: &Message) -> Result<()> {
        (self.0)(message.clone()).await
    }
}

/// Handler for an already decoded payload
#[async_trait]
pub trait TypedHandler<T>: Send {
    async fn handle(&mut self, value: T) -> Result<()>;
}

/// Decodes the JSON payload into `T` before calling the inner handler
pub struct JsonHandler<T, H> {
    inner: H,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> JsonHandler<T, H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _payload: PhantomData,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<T, H> MessageHandler for JsonHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: TypedHandler<T> + 'static,
{
    async fn handle(&mut self, message: &Message) -> Result<()> {
        let value: T = message
            .decode_json()
            .map_err(|e| MalformedPayload::new(message, e))?;
        self.inner.handle(value).await
    }
}

/// Per-runner delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub received: u64,
    pub acked: u64,

    /// Nacks and rejects
    pub nacked: u64,

    pub rejected: u64,
}

#[derive(Debug)]
enum RunnerCommand {
    GetStats {
        respond_to: oneshot::Sender<RunnerStats>,
    },
}

/// Actor that feeds one subscription into one handler
pub struct ConsumerRunner<H> {
    subscription: Subscription,
    handler: H,
    command_rx: mpsc::Receiver<RunnerCommand>,
    cancel: CancellationToken,
    stats: RunnerStats,
}

impl<H: MessageHandler> ConsumerRunner<H> {
    fn new(
        subscription: Subscription,
        handler: H,
        command_rx: mpsc::Receiver<RunnerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            handler,
            command_rx,
            cancel,
            stats: RunnerStats::default(),
        }
    }

    /// Run until cancelled or until the subscription ends
    #[instrument(skip_all, fields(topic = %self.subscription.topic(), group = %self.subscription.group()))]
    async fn run(mut self) {
        debug!("starting consumer group runner");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("runner cancelled");
                    break;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        RunnerCommand::GetStats { respond_to } => {
                            let _ = respond_to.send(self.stats.clone());
                        }
                    }
                }

                delivery = self.subscription.recv() => {
                    match delivery {
                        Some(delivery) => self.process(delivery).await,
                        None => {
                            warn!("subscription ended, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("consumer group runner stopped");
    }

    async fn process(&mut self, delivery: Delivery) {
        self.stats.received += 1;
        let attempt = delivery.attempt();
        let (message, ack) = delivery.into_parts();

        match self.handler.handle(&message).await {
            Ok(()) => {
                ack.ack();
                self.stats.acked += 1;
                trace!(message_id = %message.id, attempt, "handled, acked");
            }
            Err(e) if e.downcast_ref::<MalformedPayload>().is_some() => {
                ack.reject();
                self.stats.nacked += 1;
                self.stats.rejected += 1;
                warn!(message_id = %message.id, attempt, "rejected: {e:#}");
            }
            Err(e) => {
                ack.nack();
                self.stats.nacked += 1;
                warn!(message_id = %message.id, attempt, "handler failed, nacked: {e:#}");
            }
        }
    }
}

/// Handle for controlling a running [`ConsumerRunner`]
#[derive(Clone)]
pub struct ConsumerHandle {
    sender: mpsc::Sender<RunnerCommand>,
    cancel: CancellationToken,
    done: CancellationToken,
    topic: String,
    group: String,
}

impl ConsumerHandle {
    /// Subscribe `group` to `topic` and spawn a runner for `handler`.
    ///
    /// A subscription failure is returned here rather than inside the task.
    pub async fn spawn<B, H>(bus: &B, topic: &str, group: &str, handler: H) -> BusResult<Self>
    where
        B: MessageBus + ?Sized,
        H: MessageHandler + 'static,
    {
        Self::spawn_with_token(bus, topic, group, handler, CancellationToken::new()).await
    }

    /// Like [`ConsumerHandle::spawn`], stopping when `cancel` fires
    pub async fn spawn_with_token<B, H>(
        bus: &B,
        topic: &str,
        group: &str,
        handler: H,
        cancel: CancellationToken,
    ) -> BusResult<Self>
    where
        B: MessageBus + ?Sized,
        H: MessageHandler + 'static,
    {
        let subscription = bus.subscribe(topic, group).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let done = CancellationToken::new();

        let runner = ConsumerRunner::new(subscription, handler, cmd_rx, cancel.clone());
        let guard = done.clone().drop_guard();
        tokio::spawn(async move {
            let _guard = guard;
            runner.run().await;
        });

        Ok(Self {
            sender: cmd_tx,
            cancel,
            done,
            topic: topic.to_string(),
            group: group.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Current counters, or `None` once the runner has stopped
    pub async fn stats(&self) -> Option<RunnerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RunnerCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Ask the runner to stop after the message it is currently handling
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the runner task has exited
    pub async fn join(&self) {
        self.done.cancelled().await;
    }
}
