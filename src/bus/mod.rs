//! At-least-once message bus
//!
//! Producers publish [`Message`]s to named topics. Consumers subscribe under a
//! consumer group name and receive [`Delivery`]s which they must settle with
//! an ack or a nack.
//!
//! ```text
//!   publish ──► topic log ──┬──► group "alerts"  ──► member, member (compete)
//!                           └──► group "logs"    ──► member
//! ```
//!
//! ## Delivery guarantees
//!
//! - Every group on a topic sees every message (fan-out across groups).
//! - Members of the same group compete for the group's stream (load balancing).
//! - An acked message is never redelivered to that group.
//! - A nacked message, or one whose [`AckHandle`] is dropped unsettled, is
//!   redelivered to the group later, ahead of any newer message.
//! - A rejected message failed for good: it counts as nacked but is not
//!   redelivered.
//! - Within one group, messages arrive in publish order.
//!
//! Settling consumes the handle, so a delivery cannot be acked or nacked twice.

pub mod error;
pub mod memory;
pub mod message;
pub mod runner;

use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

pub use error::{BusError, BusResult};
pub use memory::{BusOptions, GroupStats, InMemoryBus, StartFrom};
pub use message::Message;

/// Transport contract the rest of the pipeline depends on
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append `message` to `topic`.
    ///
    /// Safe to call concurrently and never waits for consumers.
    async fn publish(&self, topic: &str, message: Message) -> BusResult<()>;

    /// Join `group` on `topic` and return its delivery stream.
    async fn subscribe(&self, topic: &str, group: &str) -> BusResult<Subscription>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, topic: &str, message: Message) -> BusResult<()> {
        (**self).publish(topic, message).await
    }

    async fn subscribe(&self, topic: &str, group: &str) -> BusResult<Subscription> {
        (**self).subscribe(topic, group).await
    }
}

/// Outcome reported back to the transport for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
    /// Nack without redelivery
    Reject,
}

/// Transport side of an [`AckHandle`]
pub trait Settle: Send {
    fn settle(self: Box<Self>, outcome: Settlement);
}

/// Transport side of a [`Subscription`]
#[async_trait]
pub trait DeliverySource: Send {
    /// Wait for the next delivery. `None` means the transport went away.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}

/// Acknowledgment decision for exactly one delivery
///
/// Dropping the handle without settling it counts as a nack.
pub struct AckHandle {
    inner: Option<Box<dyn Settle>>,
}

impl AckHandle {
    pub fn new(inner: Box<dyn Settle>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn ack(mut self) {
        self.settle(Settlement::Ack);
    }

    pub fn nack(mut self) {
        self.settle(Settlement::Nack);
    }

    pub fn reject(mut self) {
        self.settle(Settlement::Reject);
    }

    fn settle(&mut self, outcome: Settlement) {
        if let Some(inner) = self.inner.take() {
            inner.settle(outcome);
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        self.settle(Settlement::Nack);
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("settled", &self.inner.is_none())
            .finish()
    }
}

/// One message handed to one consumer group member
#[derive(Debug)]
pub struct Delivery {
    message: Arc<Message>,
    handle: AckHandle,
    attempt: u32,
}

impl Delivery {
    pub fn new(message: Arc<Message>, handle: AckHandle, attempt: u32) -> Self {
        Self {
            message,
            handle,
            attempt,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// 1 for the first delivery to this group, incremented on each redelivery
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ack(self) {
        self.handle.ack();
    }

    pub fn nack(self) {
        self.handle.nack();
    }

    pub fn reject(self) {
        self.handle.reject();
    }

    pub fn into_parts(self) -> (Arc<Message>, AckHandle) {
        (self.message, self.handle)
    }
}

/// Lazy, non-restartable stream of deliveries for one group member
pub struct Subscription {
    topic: String,
    group: String,
    source: Box<dyn DeliverySource>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        source: Box<dyn DeliverySource>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            source,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Wait for the next delivery.
    ///
    /// Cancel safe: dropping the future before it resolves loses nothing.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.source.next_delivery().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|delivery| (delivery, subscription))
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .finish()
    }
}
