use std::time::Duration;

use anyhow::Context;
use tracing::trace;

use crate::alarm::DEFAULT_THRESHOLD;
use crate::bus::{BusOptions, StartFrom};
use crate::consumers::{DEFAULT_ALERT_GROUP, DEFAULT_LOG_GROUP};
use crate::ingest::{DEFAULT_TOPIC, DROPS_HIGH};
use crate::pool::{DEFAULT_CAPACITY, PoolOptions};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub alarm: AlarmConfig,
    pub ingest: IngestConfig,
    pub consumers: ConsumersConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BusConfig {
    /// Delay before a nacked message is delivered again
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    /// Where newly created consumer groups start reading
    #[serde(default)]
    pub start_from: StartFrom,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redelivery_delay_ms: default_redelivery_delay_ms(),
            start_from: StartFrom::default(),
        }
    }
}

impl BusConfig {
    pub fn options(&self) -> BusOptions {
        BusOptions {
            redelivery_delay: Duration::from_millis(self.redelivery_delay_ms),
            start_from: self.start_from,
        }
    }
}

fn default_redelivery_delay_ms() -> u64 {
    100
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Unbounded and immediate unless configured
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            workers: default_workers(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            capacity: self.capacity,
            workers: self.workers,
            retry: self.retry,
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            devices: default_devices(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_interval_secs() -> u64 {
    1
}

fn default_devices() -> Vec<String> {
    vec![
        "dc-router-1".to_string(),
        "dc-router-2".to_string(),
        "dc-router-3".to_string(),
    ]
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_alarm_topic")]
    pub topic: String,

    #[serde(default = "default_alarm_group")]
    pub group: String,

    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Actuator endpoint; the logging actuator is used when absent
    pub webhook: Option<String>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            topic: default_alarm_topic(),
            group: default_alarm_group(),
            threshold: default_threshold(),
            webhook: None,
        }
    }
}

fn default_alarm_topic() -> String {
    "transceiver_telemetry".to_string()
}

fn default_alarm_group() -> String {
    "transceiver-alarm".to_string()
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_topic")]
    pub topic: String,

    /// Minimum `input_errors` for a report to be published
    #[serde(default = "default_high_watermark")]
    pub high_watermark: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topic: default_ingest_topic(),
            high_watermark: default_high_watermark(),
        }
    }
}

fn default_ingest_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_high_watermark() -> u64 {
    DROPS_HIGH
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConsumersConfig {
    #[serde(default = "default_alert_group")]
    pub alert_group: String,

    #[serde(default = "default_log_group")]
    pub log_group: String,

    pub alert_webhook: Option<String>,
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            alert_group: default_alert_group(),
            log_group: default_log_group(),
            alert_webhook: None,
        }
    }
}

fn default_alert_group() -> String {
    DEFAULT_ALERT_GROUP.to_string()
}

fn default_log_group() -> String {
    DEFAULT_LOG_GROUP.to_string()
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read config file {path}"))?;
    serde_json::from_str(&file_content)
        .context("Invalid configuration file provided!")
        .inspect(|config| trace!("loaded config: {config:?}"))
}
