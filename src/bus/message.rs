//! Message envelope carried by the bus
//!
//! The payload is opaque bytes. Producers that carry structured data encode it
//! as JSON, and consumers can decode it again with [`Message::decode_json`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID v4 unless supplied by the producer)
    pub id: String,

    /// Topic the message was published to (stamped by `publish`)
    pub topic: String,

    /// Opaque body
    pub payload: Vec<u8>,

    /// Free-form string headers
    pub metadata: HashMap<String, String>,

    /// When the producer created the message
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            topic: String::new(),
            payload: payload.into(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Encode `value` as a JSON payload
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?).with_metadata("content-type", "application/json"))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn payload_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}
