pub mod alarm;
pub mod bus;
pub mod config;
pub mod consumers;
pub mod device;
pub mod ingest;
pub mod pool;
pub mod retry;
pub mod telemetry;
pub mod util;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of counter collected from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    BroadcastsPkts,
    InputDrops,
    CrcErrors,
}

impl DataType {
    pub const ALL: [DataType; 3] = [
        DataType::BroadcastsPkts,
        DataType::InputDrops,
        DataType::CrcErrors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::BroadcastsPkts => "broadcasts_pkts",
            DataType::InputDrops => "input_drops",
            DataType::CrcErrors => "crc_errors",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to collect one counter from one device.
///
/// Plain value type: a retried task is indistinguishable from the original.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TelemetryTask {
    pub device_id: String,
    pub data_type: DataType,
}

impl TelemetryTask {
    pub fn new(device_id: impl Into<String>, data_type: DataType) -> Self {
        Self {
            device_id: device_id.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub ip_address: String,
}

/// Interface error report as accepted at ingestion and carried on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryData {
    pub hostname: String,
    pub interface: String,
    pub input_errors: u64,
}
