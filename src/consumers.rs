//! Alerting and logging consumers for interface error reports
//!
//! Both run as separate consumer groups on the same topic, so each one sees
//! every report regardless of how the other fares.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::TelemetryData;
use crate::bus::runner::{ConsumerHandle, JsonHandler, TypedHandler};
use crate::bus::{BusResult, MessageBus};

pub const DEFAULT_ALERT_GROUP: &str = "packet-error-alerts";
pub const DEFAULT_LOG_GROUP: &str = "packet-error-logs";

#[async_trait]
pub trait AlertsClient: Send + Sync {
    async fn send_alert(&self, data: &TelemetryData) -> Result<()>;
}

#[async_trait]
pub trait LoggingClient: Send + Sync {
    async fn log_telemetry(&self, data: &TelemetryData) -> Result<()>;
}

#[async_trait]
impl<C: AlertsClient + ?Sized> AlertsClient for Arc<C> {
    async fn send_alert(&self, data: &TelemetryData) -> Result<()> {
        (**self).send_alert(data).await
    }
}

#[async_trait]
impl<C: LoggingClient + ?Sized> LoggingClient for Arc<C> {
    async fn log_telemetry(&self, data: &TelemetryData) -> Result<()> {
        (**self).log_telemetry(data).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct TracingAlerts;

#[async_trait]
impl AlertsClient for TracingAlerts {
    async fn send_alert(&self, data: &TelemetryData) -> Result<()> {
        error!(
            hostname = %data.hostname,
            interface = %data.interface,
            input_errors = data.input_errors,
            "ALERT! high input errors on router"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TracingLogger;

#[async_trait]
impl LoggingClient for TracingLogger {
    async fn log_telemetry(&self, data: &TelemetryData) -> Result<()> {
        warn!(
            hostname = %data.hostname,
            interface = %data.interface,
            input_errors = data.input_errors,
            "high input errors detected"
        );
        Ok(())
    }
}

/// Forwards reports as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookAlerts {
    client: Client,
    url: String,
}

impl WebhookAlerts {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertsClient for WebhookAlerts {
    #[instrument(skip_all, fields(url = %self.url, hostname = %data.hostname))]
    async fn send_alert(&self, data: &TelemetryData) -> Result<()> {
        self.client
            .post(&self.url)
            .json(data)
            .send()
            .await
            .context("failed to reach alert webhook")?
            .error_for_status()
            .context("alert webhook rejected the report")?;

        debug!("alert delivered");
        Ok(())
    }
}

/// Consumer-group action that raises an alert per report
pub struct AlertAction<C>(pub C);

#[async_trait]
impl<C: AlertsClient + 'static> TypedHandler<TelemetryData> for AlertAction<C> {
    async fn handle(&mut self, data: TelemetryData) -> Result<()> {
        self.0.send_alert(&data).await
    }
}

/// Consumer-group action that records each report
pub struct LogAction<C>(pub C);

#[async_trait]
impl<C: LoggingClient + 'static> TypedHandler<TelemetryData> for LogAction<C> {
    async fn handle(&mut self, data: TelemetryData) -> Result<()> {
        self.0.log_telemetry(&data).await
    }
}

pub fn alert_handler<C: AlertsClient + 'static>(
    client: C,
) -> JsonHandler<TelemetryData, AlertAction<C>> {
    JsonHandler::new(AlertAction(client))
}

pub fn log_handler<C: LoggingClient + 'static>(
    client: C,
) -> JsonHandler<TelemetryData, LogAction<C>> {
    JsonHandler::new(LogAction(client))
}

/// The two consumer groups reading the error report topic
#[derive(Clone)]
pub struct ReportConsumers {
    pub alerts: ConsumerHandle,
    pub logs: ConsumerHandle,
}

#[derive(Debug, Clone)]
pub struct ConsumerGroups {
    pub topic: String,
    pub alert_group: String,
    pub log_group: String,
}

impl ReportConsumers {
    /// Subscribe both groups, failing if either subscription fails
    pub async fn spawn<B, A, L>(
        bus: &B,
        groups: &ConsumerGroups,
        alerts: A,
        logger: L,
        cancel: CancellationToken,
    ) -> BusResult<Self>
    where
        B: MessageBus + ?Sized,
        A: AlertsClient + 'static,
        L: LoggingClient + 'static,
    {
        let alerts = ConsumerHandle::spawn_with_token(
            bus,
            &groups.topic,
            &groups.alert_group,
            alert_handler(alerts),
            cancel.clone(),
        )
        .await?;

        let logs = match ConsumerHandle::spawn_with_token(
            bus,
            &groups.topic,
            &groups.log_group,
            log_handler(logger),
            cancel,
        )
        .await
        {
            Ok(logs) => logs,
            Err(e) => {
                alerts.shutdown();
                return Err(e);
            }
        };

        Ok(Self { alerts, logs })
    }

    pub fn shutdown(&self) {
        self.alerts.shutdown();
        self.logs.shutdown();
    }

    pub async fn join(&self) {
        self.alerts.join().await;
        self.logs.join().await;
    }
}
