//! Admission filter in front of the bus
//!
//! Interface error reports are validated and only published when the error
//! count reaches the configured high watermark. Everything below it is
//! accepted and dropped.

use std::fmt;

use tracing::{debug, instrument, trace};

use crate::TelemetryData;
use crate::bus::{BusError, Message, MessageBus};

pub const DROPS_LOW: u64 = 500;
pub const DROPS_MEDIUM: u64 = 1_000;
pub const DROPS_HIGH: u64 = 10_000;
pub const DROPS_VERY_HIGH: u64 = 100_000;

pub const DEFAULT_TOPIC: &str = "packet-counter-errors";

#[derive(Debug)]
pub enum IngestError {
    /// Malformed, incomplete or otherwise unacceptable report
    Invalid(String),

    /// The report was admitted but could not be published
    Publish(BusError),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Invalid(msg) => write!(f, "invalid telemetry: {}", msg),
            IngestError::Publish(e) => write!(f, "failed to publish telemetry: {}", e),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::Publish(e) => Some(e),
            IngestError::Invalid(_) => None,
        }
    }
}

impl From<BusError> for IngestError {
    fn from(e: BusError) -> Self {
        IngestError::Publish(e)
    }
}

/// What happened to an accepted report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Published; carries the message id
    Published(String),

    /// Valid but under the watermark, not published
    BelowWatermark,
}

#[derive(Debug, Clone)]
pub struct IngestGateway<B> {
    bus: B,
    topic: String,
    high_watermark: u64,
}

impl<B: MessageBus> IngestGateway<B> {
    pub fn new(bus: B, topic: impl Into<String>, high_watermark: u64) -> Self {
        Self {
            bus,
            topic: topic.into(),
            high_watermark,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Decode a JSON report and ingest it
    pub async fn ingest_json(&self, body: &[u8]) -> Result<Admission, IngestError> {
        let data: TelemetryData = serde_json::from_slice(body)
            .map_err(|e| IngestError::Invalid(format!("malformed data received: {e}")))?;
        self.ingest(&data).await
    }

    #[instrument(skip_all, fields(hostname = %data.hostname, input_errors = data.input_errors))]
    pub async fn ingest(&self, data: &TelemetryData) -> Result<Admission, IngestError> {
        if data.hostname.is_empty() || data.input_errors == 0 {
            debug!("rejecting incomplete report");
            return Err(IngestError::Invalid(
                "hostname and input_errors are required".to_string(),
            ));
        }

        if data.input_errors < self.high_watermark {
            trace!(watermark = self.high_watermark, "below watermark, not published");
            return Ok(Admission::BelowWatermark);
        }

        let message =
            Message::json(data).map_err(|e| IngestError::Invalid(format!("cannot encode: {e}")))?;
        let id = message.id.clone();
        self.bus.publish(&self.topic, message).await?;

        debug!(message_id = %id, topic = %self.topic, "published high error report");
        Ok(Admission::Published(id))
    }
}
