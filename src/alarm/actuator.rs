//! Alarm actuation backends

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, instrument, trace};

/// Side-effecting alarm control
#[async_trait]
pub trait AlarmActuator: Send + Sync {
    async fn start_alarm(&self) -> Result<()>;
    async fn stop_alarm(&self) -> Result<()>;
}

#[async_trait]
impl<A> AlarmActuator for Arc<A>
where
    A: AlarmActuator + ?Sized,
{
    async fn start_alarm(&self) -> Result<()> {
        (**self).start_alarm().await
    }

    async fn stop_alarm(&self) -> Result<()> {
        (**self).stop_alarm().await
    }
}

/// Actuator that only logs, for running without alarm hardware
#[derive(Debug, Clone, Default)]
pub struct LoggingActuator;

#[async_trait]
impl AlarmActuator for LoggingActuator {
    async fn start_alarm(&self) -> Result<()> {
        info!("alarm started");
        Ok(())
    }

    async fn stop_alarm(&self) -> Result<()> {
        info!("alarm stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum Action {
    Start,
    Stop,
}

#[derive(Debug, Serialize)]
struct ActionRequest {
    action: Action,
}

/// Actuator that POSTs `{"action": "start" | "stop"}` to a URL
#[derive(Debug, Clone)]
pub struct WebhookActuator {
    client: Client,
    url: String,
}

impl WebhookActuator {
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

    pub fn url(&self) -> &str {
        &self.url
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn send(&self, action: Action) -> Result<()> {
        trace!("sending alarm action");

        self.client
            .post(&self.url)
            .json(&ActionRequest { action })
            .send()
            .await
            .context("failed to reach alarm webhook")?
            .error_for_status()
            .context("alarm webhook rejected the action")?;

        Ok(())
    }
}

#[async_trait]
impl AlarmActuator for WebhookActuator {
    async fn start_alarm(&self) -> Result<()> {
        self.send(Action::Start).await
    }

    async fn stop_alarm(&self) -> Result<()> {
        self.send(Action::Stop).await
    }
}
