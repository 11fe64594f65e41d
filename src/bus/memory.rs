//! In-process bus backend
//!
//! Each topic keeps an append-only log plus one cursor record per consumer
//! group. Deliveries are claimed under the topic table lock, so members of the
//! same group never receive the same message at the same time.
//!
//! ## Group cursor
//!
//! ```text
//!   offsets:   committed        next_offset
//!                  │                 │
//!   log:  [ acked | in flight / nacked / acked-ahead | not yet delivered ]
//! ```
//!
//! - `committed`: every offset below it has been acked
//! - `next_offset`: first message never handed to this group
//! - nacked offsets wait in `redeliver` until their delay has passed; while
//!   any is waiting the group gets no fresh messages, lowest offset first, so
//!   a single consumer sees the log in publish order even across nacks
//!
//! Messages below the smallest `committed` of all groups are dropped from the
//! log.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    AckHandle, BusError, BusResult, Delivery, DeliverySource, Message, MessageBus, Settle,
    Settlement, Subscription,
};

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Oldest message still retained on the topic
    #[default]
    Earliest,

    /// Only messages published after the group was created
    Latest,
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    /// How long a nacked message waits before it is handed out again
    pub redelivery_delay: Duration,

    pub start_from: StartFrom,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            redelivery_delay: Duration::from_millis(100),
            start_from: StartFrom::Earliest,
        }
    }
}

/// Delivery counters for one consumer group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Deliveries handed out, redeliveries included
    pub delivered: u64,
    pub acked: u64,

    /// Nacks and rejects
    pub nacked: u64,

    /// Messages given up on without redelivery
    pub rejected: u64,

    /// Messages not yet acked by the group (in flight included)
    pub pending: u64,

    pub in_flight: u64,
}

#[derive(Debug)]
struct GroupState {
    committed: u64,
    next_offset: u64,
    redeliver: BTreeMap<u64, Instant>,
    in_flight: HashSet<u64>,
    acked_ahead: BTreeSet<u64>,
    attempts: HashMap<u64, u32>,
    stats: GroupStats,
}

impl GroupState {
    fn starting_at(offset: u64) -> Self {
        Self {
            committed: offset,
            next_offset: offset,
            redeliver: BTreeMap::new(),
            in_flight: HashSet::new(),
            acked_ahead: BTreeSet::new(),
            attempts: HashMap::new(),
            stats: GroupStats::default(),
        }
    }

    /// Mark `offset` as done for this group
    fn commit(&mut self, offset: u64) {
        self.attempts.remove(&offset);
        if offset == self.committed {
            self.committed += 1;
            while self.acked_ahead.remove(&self.committed) {
                self.committed += 1;
            }
        } else {
            self.acked_ahead.insert(offset);
        }
    }
}

enum Claim {
    Ready(Arc<Message>, u64, u32),
    WaitUntil(Option<Instant>),
}

#[derive(Debug)]
struct TopicLog {
    base_offset: u64,
    messages: VecDeque<Arc<Message>>,
    groups: HashMap<String, GroupState>,

    /// Bumped on every publish and nack to wake parked subscribers
    version: watch::Sender<u64>,
}

impl TopicLog {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            base_offset: 0,
            messages: VecDeque::new(),
            groups: HashMap::new(),
            version,
        }
    }

    fn end_offset(&self) -> u64 {
        self.base_offset + self.messages.len() as u64
    }

    fn message_at(&self, offset: u64) -> Option<Arc<Message>> {
        let index = offset.checked_sub(self.base_offset)?;
        self.messages.get(index as usize).cloned()
    }

    fn claim(&mut self, group: &str, now: Instant) -> Claim {
        let end = self.end_offset();
        let Some(state) = self.groups.get_mut(group) else {
            return Claim::WaitUntil(None);
        };

        let offset = if let Some((&offset, &ready_at)) = state.redeliver.first_key_value() {
            if ready_at > now {
                return Claim::WaitUntil(Some(ready_at));
            }
            state.redeliver.remove(&offset);
            offset
        } else if state.next_offset < end {
            let offset = state.next_offset;
            state.next_offset += 1;
            offset
        } else {
            return Claim::WaitUntil(None);
        };

        let attempt = state.attempts.entry(offset).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        state.in_flight.insert(offset);
        state.stats.delivered += 1;

        match self.message_at(offset) {
            Some(message) => Claim::Ready(message, offset, attempt),
            // offsets at or above every group's `committed` are never trimmed
            None => Claim::WaitUntil(None),
        }
    }

    fn trim(&mut self) {
        let Some(low_water) = self.groups.values().map(|g| g.committed).min() else {
            return;
        };
        while self.base_offset < low_water && self.messages.pop_front().is_some() {
            self.base_offset += 1;
        }
    }
}

#[derive(Debug)]
struct Shared {
    topics: Mutex<HashMap<String, TopicLog>>,
    closed: CancellationToken,
    options: BusOptions,
}

impl Shared {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, topic: &str, group: &str, offset: u64, outcome: Settlement) {
        let mut topics = self.topics();
        let Some(log) = topics.get_mut(topic) else {
            return;
        };
        let Some(state) = log.groups.get_mut(group) else {
            return;
        };

        if !state.in_flight.remove(&offset) {
            warn!(topic, group, offset, "settle for a delivery that is not in flight");
            return;
        }

        match outcome {
            Settlement::Ack => {
                state.commit(offset);
                state.stats.acked += 1;
                trace!(topic, group, offset, "acked");
                log.trim();
            }
            Settlement::Reject => {
                state.commit(offset);
                state.stats.nacked += 1;
                state.stats.rejected += 1;
                debug!(topic, group, offset, "rejected, not redelivered");
                log.trim();
            }
            Settlement::Nack => {
                let ready_at = Instant::now() + self.options.redelivery_delay;
                state.redeliver.insert(offset, ready_at);
                state.stats.nacked += 1;
                trace!(topic, group, offset, "nacked, scheduled for redelivery");
                log.version.send_modify(|v| *v += 1);
            }
        }
    }
}

/// Bus backend living entirely inside the process
///
/// Cloning yields another handle to the same bus.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(BusOptions::default())
    }
}

impl InMemoryBus {
    pub fn new(options: BusOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics: Mutex::new(HashMap::new()),
                closed: CancellationToken::new(),
                options,
            }),
        }
    }

    /// Stop accepting publishes and subscriptions and release parked subscribers
    pub fn close(&self) {
        debug!("closing in-memory bus");
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn group_stats(&self, topic: &str, group: &str) -> Option<GroupStats> {
        let topics = self.shared.topics();
        let log = topics.get(topic)?;
        let state = log.groups.get(group)?;

        let mut stats = state.stats.clone();
        stats.pending =
            log.end_offset() - state.committed - state.acked_ahead.len() as u64;
        stats.in_flight = state.in_flight.len() as u64;
        Some(stats)
    }

    /// Number of messages still held for `topic`
    pub fn retained(&self, topic: &str) -> usize {
        self.shared
            .topics()
            .get(topic)
            .map(|log| log.messages.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, mut message: Message) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Unavailable("bus is closed".to_string()));
        }

        message.topic = topic.to_string();
        let id = message.id.clone();

        let mut topics = self.shared.topics();
        let log = topics
            .entry(topic.to_string())
            .or_insert_with(TopicLog::new);
        log.messages.push_back(Arc::new(message));
        log.version.send_modify(|v| *v += 1);

        trace!(topic, message_id = %id, offset = log.end_offset() - 1, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> BusResult<Subscription> {
        if self.is_closed() {
            return Err(BusError::Subscription("bus is closed".to_string()));
        }
        if topic.trim().is_empty() {
            return Err(BusError::Subscription("topic name is empty".to_string()));
        }
        if group.trim().is_empty() {
            return Err(BusError::Subscription("consumer group name is empty".to_string()));
        }

        let version = {
            let mut topics = self.shared.topics();
            let log = topics
                .entry(topic.to_string())
                .or_insert_with(TopicLog::new);

            let start = match self.shared.options.start_from {
                StartFrom::Earliest => log.base_offset,
                StartFrom::Latest => log.end_offset(),
            };
            if !log.groups.contains_key(group) {
                debug!(topic, group, start, "creating consumer group");
                log.groups
                    .insert(group.to_string(), GroupState::starting_at(start));
            }
            log.version.subscribe()
        };

        let source = MemorySource {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            version,
        };
        Ok(Subscription::new(topic, group, Box::new(source)))
    }
}

struct MemorySource {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    version: watch::Receiver<u64>,
}

#[async_trait]
impl DeliverySource for MemorySource {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            if self.shared.closed.is_cancelled() {
                return None;
            }

            // mark the current version as seen before looking, so a publish
            // racing with the claim below still wakes us
            self.version.borrow_and_update();

            let wait_until = {
                let mut topics = self.shared.topics();
                let log = topics.get_mut(&self.topic)?;
                match log.claim(&self.group, Instant::now()) {
                    Claim::Ready(message, offset, attempt) => {
                        let handle = AckHandle::new(Box::new(MemoryAck {
                            shared: self.shared.clone(),
                            topic: self.topic.clone(),
                            group: self.group.clone(),
                            offset,
                        }));
                        return Some(Delivery::new(message, handle, attempt));
                    }
                    Claim::WaitUntil(at) => at,
                }
            };

            let redelivery_due = async {
                match wait_until {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.shared.closed.cancelled() => return None,
                changed = self.version.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = redelivery_due => {}
            }
        }
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    offset: u64,
}

impl Settle for MemoryAck {
    fn settle(self: Box<Self>, outcome: Settlement) {
        self.shared
            .settle(&self.topic, &self.group, self.offset, outcome);
    }
}
