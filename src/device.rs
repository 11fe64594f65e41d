//! Device configuration and monitoring workflow

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, instrument};

use crate::Device;
use crate::retry::{Backoff, RetryPolicy, retry};

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get_device(&self, ip_address: &str) -> Result<Device>;
}

#[async_trait]
pub trait ConfigurationClient: Send + Sync {
    async fn configure_device(&self, device: &Device) -> Result<()>;
}

#[async_trait]
pub trait MonitoringClient: Send + Sync {
    async fn monitor_device(&self, device: &Device) -> Result<()>;
}

/// Default step policy: three attempts, two seconds apart
pub fn default_step_policy() -> RetryPolicy {
    RetryPolicy::bounded(
        3,
        Backoff::Fixed {
            delay: Duration::from_secs(2),
        },
    )
}

pub struct NetworkHandler<R, C, M> {
    repository: R,
    configuration: C,
    monitoring: M,
    policy: RetryPolicy,
}

impl<R, C, M> NetworkHandler<R, C, M>
where
    R: DeviceRepository,
    C: ConfigurationClient,
    M: MonitoringClient,
{
    pub fn new(repository: R, configuration: C, monitoring: M) -> Self {
        Self {
            repository,
            configuration,
            monitoring,
            policy: default_step_policy(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve the device, then configure and monitor it.
    ///
    /// Resolution is attempted once; the other steps are retried under the
    /// handler's policy.
    #[instrument(skip(self))]
    pub async fn perform_network_operation(&self, ip_address: &str) -> Result<()> {
        let device = self
            .repository
            .get_device(ip_address)
            .await
            .context("failed to get device")?;

        retry(&self.policy, |_| self.configuration.configure_device(&device))
            .await
            .context("failed to configure device after retries")?;

        retry(&self.policy, |_| self.monitoring.monitor_device(&device))
            .await
            .context("failed to monitor device after retries")?;

        Ok(())
    }
}

/// Repository that knows every address
#[derive(Debug, Clone, Default)]
pub struct StaticRepository;

#[async_trait]
impl DeviceRepository for StaticRepository {
    async fn get_device(&self, ip_address: &str) -> Result<Device> {
        Ok(Device {
            ip_address: ip_address.to_string(),
        })
    }
}

/// Configuration and monitoring client that only logs
#[derive(Debug, Clone, Default)]
pub struct LoggingDeviceClient;

#[async_trait]
impl ConfigurationClient for LoggingDeviceClient {
    async fn configure_device(&self, device: &Device) -> Result<()> {
        info!(ip = %device.ip_address, "configuring device");
        Ok(())
    }
}

#[async_trait]
impl MonitoringClient for LoggingDeviceClient {
    async fn monitor_device(&self, device: &Device) -> Result<()> {
        info!(ip = %device.ip_address, "monitoring device");
        Ok(())
    }
}
