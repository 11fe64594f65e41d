//! Alarm supervisor - level-triggered hysteresis over a power signal
//!
//! Every reading re-asserts the desired alarm state through the actuator:
//!
//! ```text
//! reading < threshold  ──► start_alarm ──┬─ Ok  ──► state = Enabled,  ack
//! reading >= threshold ──► stop_alarm  ──┤
//!                                        └─ Err ──► state unchanged,  nack
//! ```
//!
//! The confirmed state only changes after a successful actuation, so a
//! redelivered (or the next fresh) reading heals the state once the actuator
//! recovers.

mod actuator;

use std::fmt;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::bus::runner::{ConsumerHandle, MalformedPayload, MessageHandler};
use crate::bus::{BusResult, Message, MessageBus};

pub use actuator::{AlarmActuator, LoggingActuator, WebhookActuator};

/// Power level (dBm) below which the alarm is raised
pub const DEFAULT_THRESHOLD: f64 = -40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlarmState {
    #[default]
    Disabled,
    Enabled,
}

impl AlarmState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, AlarmState::Enabled)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmState::Disabled => write!(f, "disabled"),
            AlarmState::Enabled => write!(f, "enabled"),
        }
    }
}

/// Desired alarm state for one reading
pub fn evaluate(reading: f64, threshold: f64) -> AlarmState {
    if reading < threshold {
        AlarmState::Enabled
    } else {
        AlarmState::Disabled
    }
}

/// Parse a power reading from a UTF-8 decimal payload
pub fn decode_power(payload: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(payload).context("power reading is not valid UTF-8")?;
    let value: f64 = text
        .trim()
        .parse()
        .with_context(|| format!("invalid power reading {text:?}"))?;

    if !value.is_finite() {
        bail!("power reading {value} is not finite");
    }

    Ok(value)
}

/// Read-only view of the last confirmed alarm state
#[derive(Debug, Clone)]
pub struct AlarmWatch {
    rx: watch::Receiver<AlarmState>,
}

impl AlarmWatch {
    pub fn current(&self) -> AlarmState {
        *self.rx.borrow()
    }

    pub fn is_enabled(&self) -> bool {
        self.current().is_enabled()
    }

    /// Wait until the confirmed state equals `state`.
    ///
    /// Returns `false` if the supervisor went away first.
    pub async fn wait_for(&mut self, state: AlarmState) -> bool {
        self.rx.wait_for(|current| *current == state).await.is_ok()
    }

    /// Wait for the next confirmed transition
    pub async fn changed(&mut self) -> Option<AlarmState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Single owner of one alarm's state
pub struct AlarmSupervisor<A> {
    actuator: A,
    threshold: f64,
    state: watch::Sender<AlarmState>,
}

impl<A: AlarmActuator> AlarmSupervisor<A> {
    pub fn new(actuator: A, threshold: f64) -> (Self, AlarmWatch) {
        let (state, rx) = watch::channel(AlarmState::Disabled);
        let supervisor = Self {
            actuator,
            threshold,
            state,
        };
        (supervisor, AlarmWatch { rx })
    }

    pub fn state(&self) -> AlarmState {
        *self.state.borrow()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Drive the actuator towards the state `reading` asks for.
    ///
    /// On failure the confirmed state is left as it was.
    pub async fn apply(&mut self, reading: f64) -> Result<AlarmState> {
        let desired = evaluate(reading, self.threshold);

        let result = match desired {
            AlarmState::Enabled => self.actuator.start_alarm().await.context("start alarm failed"),
            AlarmState::Disabled => self.actuator.stop_alarm().await.context("stop alarm failed"),
        };

        if let Err(e) = result {
            warn!(reading, %desired, kept = %self.state(), "actuation failed: {e:#}");
            return Err(e);
        }

        // Only notify watchers on real transitions.
        let previous = self.state();
        if previous != desired {
            self.state.send_replace(desired);
            debug!(reading, from = %previous, to = %desired, "alarm transition");
        } else {
            trace!(reading, state = %desired, "alarm state re-asserted");
        }

        Ok(desired)
    }
}

#[async_trait]
impl<A: AlarmActuator + 'static> MessageHandler for AlarmSupervisor<A> {
    #[instrument(skip_all, fields(message_id = %message.id))]
    async fn handle(&mut self, message: &Message) -> Result<()> {
        let reading =
            decode_power(&message.payload).map_err(|e| MalformedPayload::new(message, e))?;
        self.apply(reading).await?;
        Ok(())
    }
}

/// A running supervisor bound to a consumer group
#[derive(Clone)]
pub struct AlarmHandle {
    consumer: ConsumerHandle,
    watch: AlarmWatch,
}

impl AlarmHandle {
    pub async fn spawn<B, A>(
        bus: &B,
        topic: &str,
        group: &str,
        actuator: A,
        threshold: f64,
    ) -> BusResult<Self>
    where
        B: MessageBus + ?Sized,
        A: AlarmActuator + 'static,
    {
        Self::spawn_with_token(bus, topic, group, actuator, threshold, CancellationToken::new())
            .await
    }

    pub async fn spawn_with_token<B, A>(
        bus: &B,
        topic: &str,
        group: &str,
        actuator: A,
        threshold: f64,
        cancel: CancellationToken,
    ) -> BusResult<Self>
    where
        B: MessageBus + ?Sized,
        A: AlarmActuator + 'static,
    {
        let (supervisor, watch) = AlarmSupervisor::new(actuator, threshold);
        let consumer = ConsumerHandle::spawn_with_token(bus, topic, group, supervisor, cancel).await?;
        Ok(Self { consumer, watch })
    }

    pub fn state(&self) -> AlarmState {
        self.watch.current()
    }

    pub fn watch(&self) -> AlarmWatch {
        self.watch.clone()
    }

    pub fn consumer(&self) -> &ConsumerHandle {
        &self.consumer
    }

    pub fn shutdown(&self) {
        self.consumer.shutdown();
    }

    pub async fn join(&self) {
        self.consumer.join().await;
    }
}
