//! Failure tests for the pipeline
//!
//! These tests verify that the system recovers from:
//! - Actuator outages (alarm state self-heals through redelivery)
//! - Malformed payloads (rejected, loop keeps running)
//! - Consumer failures in one group (other groups unaffected)
//! - Permanently failing pool tasks (bounded policy dead-letters them)
//! - A closed bus (publishers and runners stop cleanly)

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use telemetry_pipeline::alarm::{AlarmHandle, AlarmState, DEFAULT_THRESHOLD, WebhookActuator};
use telemetry_pipeline::bus::runner::{ConsumerHandle, handler_fn};
use telemetry_pipeline::bus::{BusError, InMemoryBus, Message, MessageBus};
use telemetry_pipeline::consumers::{ConsumerGroups, ReportConsumers};
use telemetry_pipeline::ingest::{DROPS_HIGH, IngestError, IngestGateway};
use telemetry_pipeline::pool::{Collector, PoolOptions, WorkerPool};
use telemetry_pipeline::retry::{Backoff, RetryPolicy};
use telemetry_pipeline::{DataType, TelemetryTask};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

const TOPIC: &str = "transceiver_telemetry";

#[tokio::test]
async fn test_alarm_heals_after_actuator_outage() {
    let bus = create_test_bus();
    let actuator = Arc::new(SwitchableActuator::default());
    let alarm = AlarmHandle::spawn(&bus, TOPIC, "alarm", actuator.clone(), DEFAULT_THRESHOLD)
        .await
        .unwrap();
    let mut watch = alarm.watch();

    bus.publish(TOPIC, Message::new("-45.0")).await.unwrap();
    assert!(watch.wait_for(AlarmState::Enabled).await);

    bus.publish(TOPIC, Message::new("-35.0")).await.unwrap();
    assert!(watch.wait_for(AlarmState::Disabled).await);

    actuator.set_failing(true);
    bus.publish(TOPIC, Message::new("-45.0")).await.unwrap();
    eventually(|| actuator.calls().contains(&(AlarmCall::Start, false))).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(alarm.state(), AlarmState::Disabled);

    actuator.set_failing(false);
    tokio::time::timeout(Duration::from_secs(1), watch.wait_for(AlarmState::Enabled))
        .await
        .expect("redelivery should re-assert the alarm");

    eventually(|| bus.group_stats(TOPIC, "alarm").unwrap().pending == 0).await;
    assert!(bus.group_stats(TOPIC, "alarm").unwrap().nacked >= 1);

    alarm.shutdown();
}

#[tokio::test]
async fn test_alarm_heals_with_webhook_actuator() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let bus = create_test_bus();
    let actuator = WebhookActuator::new(server.uri()).unwrap();
    let alarm = AlarmHandle::spawn(&bus, TOPIC, "alarm", actuator, DEFAULT_THRESHOLD)
        .await
        .unwrap();
    let mut watch = alarm.watch();

    bus.publish(TOPIC, Message::new("-41.5")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), watch.wait_for(AlarmState::Enabled))
        .await
        .unwrap();

    eventually(|| bus.group_stats(TOPIC, "alarm").unwrap().acked == 1).await;
    assert_eq!(bus.group_stats(TOPIC, "alarm").unwrap().nacked, 2);

    alarm.shutdown();
}

#[tokio::test]
async fn test_malformed_reading_does_not_stop_alarm() {
    let bus = create_test_bus();
    let actuator = Arc::new(SwitchableActuator::default());
    let alarm = AlarmHandle::spawn(&bus, TOPIC, "alarm", actuator.clone(), DEFAULT_THRESHOLD)
        .await
        .unwrap();
    let mut watch = alarm.watch();

    bus.publish(TOPIC, Message::new("-45.0dBm")).await.unwrap();
    bus.publish(TOPIC, Message::new("-45.0")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), watch.wait_for(AlarmState::Enabled))
        .await
        .unwrap();
    assert!(actuator.calls().iter().all(|(call, _)| *call == AlarmCall::Start));
    assert_eq!(bus.group_stats(TOPIC, "alarm").unwrap().rejected, 1);

    alarm.shutdown();
}

#[tokio::test]
async fn test_redelivered_reading_does_not_override_newer_one() {
    let bus = InMemoryBus::default();
    let actuator = Arc::new(SwitchableActuator::default());
    actuator.set_failing(true);
    let alarm = AlarmHandle::spawn(&bus, TOPIC, "alarm", actuator.clone(), DEFAULT_THRESHOLD)
        .await
        .unwrap();

    bus.publish(TOPIC, Message::new("-45.0")).await.unwrap();
    eventually(|| actuator.calls().contains(&(AlarmCall::Start, false))).await;

    actuator.set_failing(false);
    bus.publish(TOPIC, Message::new("-35.0")).await.unwrap();

    eventually(|| bus.group_stats(TOPIC, "alarm").unwrap().acked == 2).await;
    assert_eq!(alarm.state(), AlarmState::Disabled);
    assert_eq!(actuator.calls().last(), Some(&(AlarmCall::Stop, true)));

    alarm.shutdown();
}

#[tokio::test]
async fn test_failing_group_does_not_block_other_group() {
    let bus = create_test_bus();
    let alerts = Arc::new(RecordingSink::default());
    let logs = Arc::new(RecordingSink::default());
    alerts.set_failing(true);

    let groups = ConsumerGroups {
        topic: "reports".to_string(),
        alert_group: "alerts".to_string(),
        log_group: "logs".to_string(),
    };
    let consumers = ReportConsumers::spawn(
        &bus,
        &groups,
        alerts.clone(),
        logs.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let gateway = IngestGateway::new(bus.clone(), "reports", DROPS_HIGH);
    gateway.ingest(&create_report("edge-1", 50_000)).await.unwrap();

    eventually(|| logs.seen() == vec!["edge-1".to_string()]).await;
    assert!(alerts.seen().is_empty());

    // The alert group catches up once its sink recovers.
    alerts.set_failing(false);
    eventually(|| alerts.seen() == vec!["edge-1".to_string()]).await;

    let alert_stats = consumers.alerts.stats().await.unwrap();
    assert!(alert_stats.nacked >= 1);
    assert_eq!(consumers.logs.stats().await.unwrap().nacked, 0);

    consumers.shutdown();
}

struct AlwaysFails;

#[async_trait::async_trait]
impl Collector<TelemetryTask> for AlwaysFails {
    async fn collect(&self, task: &TelemetryTask) -> anyhow::Result<()> {
        anyhow::bail!("device {} unreachable", task.device_id)
    }
}

#[tokio::test]
async fn test_permanent_failure_is_dead_lettered() {
    let options = PoolOptions {
        retry: RetryPolicy::bounded(
            4,
            Backoff::Exponential {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(4),
            },
        ),
        ..Default::default()
    };
    let (pool, mut dead) = WorkerPool::spawn(AlwaysFails, options);

    let task = TelemetryTask::new("dc-router-1", DataType::CrcErrors);
    pool.send(task.clone()).await.unwrap();

    let letter = tokio::time::timeout(Duration::from_secs(1), dead.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(letter.task, task);
    assert_eq!(letter.attempts, 4);
    assert!(letter.error.contains("dc-router-1 unreachable"));

    let stats = pool.stats();
    assert_eq!(stats.requeued, 3);
    assert_eq!(stats.dead_lettered, 1);

    pool.shutdown();
}

#[tokio::test]
async fn test_closed_bus_stops_publishers_and_runners() {
    let bus = create_test_bus();
    let runner = ConsumerHandle::spawn(&bus, "t", "g", handler_fn(|_msg| async { Ok(()) }))
        .await
        .unwrap();
    let gateway = IngestGateway::new(bus.clone(), "t", DROPS_HIGH);

    bus.close();

    tokio::time::timeout(Duration::from_secs(1), runner.join())
        .await
        .expect("runner should stop once the bus is closed");
    assert_matches!(
        bus.publish("t", Message::new("late")).await,
        Err(BusError::Unavailable(_))
    );
    assert_matches!(
        bus.subscribe("t", "other").await,
        Err(BusError::Subscription(_))
    );
    assert_matches!(
        gateway.ingest(&create_report("edge-1", DROPS_HIGH)).await,
        Err(IngestError::Publish(BusError::Unavailable(_)))
    );
}
