//! Simulated telemetry collection
//!
//! ```text
//! ticker ──► TelemetryScheduler ──► devices × DataType::ALL ──► PoolHandle::send
//!                                                                    │
//!                                              SimulatedCollector ◄──┘
//! ```

use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use rand::Rng;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::pool::{Collector, PoolHandle, PoolResult};
use crate::{DataType, TelemetryTask};

pub const DEFAULT_FAILURE_RATE: f64 = 0.1;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Plausible counter range for each data type
pub fn value_range(data_type: DataType) -> RangeInclusive<u64> {
    match data_type {
        DataType::BroadcastsPkts => 5_000..=15_000,
        DataType::InputDrops => 0..=500,
        DataType::CrcErrors => 0..=100,
    }
}

/// Collector that fabricates readings and fails at random
#[derive(Debug, Clone)]
pub struct SimulatedCollector {
    failure_rate: f64,
}

impl Default for SimulatedCollector {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_RATE)
    }
}

impl SimulatedCollector {
    /// `failure_rate` is clamped to `0.0..=1.0`
    pub fn new(failure_rate: f64) -> Self {
        let failure_rate = if failure_rate.is_nan() {
            0.0
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        Self { failure_rate }
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }

    /// One reading, or `None` when the simulated device does not answer
    pub fn sample(&self, data_type: DataType) -> Option<u64> {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.failure_rate) {
            return None;
        }
        Some(rng.gen_range(value_range(data_type)))
    }
}

#[async_trait]
impl Collector<TelemetryTask> for SimulatedCollector {
    async fn collect(&self, task: &TelemetryTask) -> Result<()> {
        match self.sample(task.data_type) {
            Some(value) => {
                info!(
                    device = %task.device_id,
                    data_type = %task.data_type,
                    value,
                    "collected telemetry"
                );
                Ok(())
            }
            None => bail!("failed to collect data from device {}", task.device_id),
        }
    }
}

/// Periodically emits one collection task per device and data type
#[derive(Debug, Clone)]
pub struct TelemetryScheduler {
    devices: Vec<String>,
    interval: Duration,
}

impl TelemetryScheduler {
    /// A zero `interval` is raised to one millisecond.
    pub fn new(devices: Vec<String>, interval: Duration) -> Self {
        Self {
            devices,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Tasks emitted on every tick
    pub fn batch(&self) -> impl Iterator<Item = TelemetryTask> + '_ {
        self.devices.iter().flat_map(|device| {
            DataType::ALL
                .into_iter()
                .map(move |data_type| TelemetryTask::new(device.clone(), data_type))
        })
    }

    /// Emit a batch every interval until `cancel` fires.
    ///
    /// A full pool queue delays the batch; a stopped pool ends the loop with
    /// [`crate::pool::PoolError::Stopped`].
    #[instrument(skip_all, fields(devices = self.devices.len(), interval = ?self.interval))]
    pub async fn run(
        self,
        pool: PoolHandle<TelemetryTask>,
        cancel: CancellationToken,
    ) -> PoolResult<()> {
        debug!("starting telemetry scheduler");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for task in self.batch() {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!("telemetry scheduler cancelled mid-batch");
                                return Ok(());
                            }
                            result = pool.send(task) => result?,
                        }
                    }
                }
            }
        }

        debug!("telemetry scheduler stopped");
        Ok(())
    }
}
