//! End-to-end tests for the pipeline
//!
//! These tests verify that:
//! - Ingested reports reach both consumer groups
//! - The alarm supervisor follows power readings published on the bus
//! - Scheduled telemetry tasks flow through the worker pool

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use telemetry_pipeline::alarm::{AlarmHandle, AlarmState, DEFAULT_THRESHOLD};
use telemetry_pipeline::bus::{Message, MessageBus};
use telemetry_pipeline::consumers::{ConsumerGroups, ReportConsumers};
use telemetry_pipeline::ingest::{Admission, DROPS_HIGH, IngestGateway};
use telemetry_pipeline::pool::{PoolOptions, WorkerPool};
use telemetry_pipeline::telemetry::{SimulatedCollector, TelemetryScheduler};
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

fn groups() -> ConsumerGroups {
    ConsumerGroups {
        topic: "packet-counter-errors".to_string(),
        alert_group: "packet-error-alerts".to_string(),
        log_group: "packet-error-logs".to_string(),
    }
}

#[tokio::test]
async fn test_ingested_reports_fan_out_to_both_groups() {
    let bus = create_test_bus();
    let alerts = Arc::new(RecordingSink::default());
    let logs = Arc::new(RecordingSink::default());

    let consumers = ReportConsumers::spawn(
        &bus,
        &groups(),
        alerts.clone(),
        logs.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let gateway = IngestGateway::new(bus.clone(), "packet-counter-errors", DROPS_HIGH);
    assert!(matches!(
        gateway.ingest(&create_report("edge-1", 25_000)).await.unwrap(),
        Admission::Published(_)
    ));
    assert_eq!(
        gateway.ingest(&create_report("edge-2", 20)).await.unwrap(),
        Admission::BelowWatermark
    );
    assert!(matches!(
        gateway.ingest(&create_report("edge-3", DROPS_HIGH)).await.unwrap(),
        Admission::Published(_)
    ));

    eventually(|| alerts.seen().len() == 2 && logs.seen().len() == 2).await;
    assert_eq!(alerts.seen(), vec!["edge-1", "edge-3"]);
    assert_eq!(logs.seen(), vec!["edge-1", "edge-3"]);

    consumers.shutdown();
    consumers.join().await;
}

#[tokio::test]
async fn test_alarm_follows_published_readings() {
    let bus = create_test_bus();
    let actuator = Arc::new(SwitchableActuator::default());
    let alarm = AlarmHandle::spawn(
        &bus,
        "transceiver_telemetry",
        "transceiver-alarm",
        actuator.clone(),
        DEFAULT_THRESHOLD,
    )
    .await
    .unwrap();
    let mut watch = alarm.watch();

    bus.publish("transceiver_telemetry", Message::new("-45.0"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), watch.wait_for(AlarmState::Enabled))
        .await
        .unwrap();

    bus.publish("transceiver_telemetry", Message::new("-35.0"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), watch.wait_for(AlarmState::Disabled))
        .await
        .unwrap();

    assert_eq!(
        actuator.calls(),
        vec![(AlarmCall::Start, true), (AlarmCall::Stop, true)]
    );

    let stats = alarm.consumer().stats().await.unwrap();
    assert_eq!(stats.acked, 2);
    assert_eq!(stats.nacked, 0);

    alarm.shutdown();
    alarm.join().await;
}

#[tokio::test]
async fn test_scheduled_tasks_are_collected() {
    let (pool, _dead) = WorkerPool::spawn(SimulatedCollector::new(0.0), PoolOptions::default());
    let scheduler = TelemetryScheduler::new(
        vec!["dc-router-1".to_string(), "dc-router-2".to_string()],
        Duration::from_millis(50),
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(pool.clone(), cancel.clone()));

    eventually(|| pool.stats().succeeded >= 12).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let stats = pool.stats();
    assert!(stats.submitted >= 12);
    assert_eq!(stats.failed, 0);

    pool.shutdown();
    pool.join().await;
}

#[tokio::test]
async fn test_flaky_collection_still_completes_every_task() {
    let options = PoolOptions {
        workers: 3,
        ..Default::default()
    };
    let (pool, _dead) = WorkerPool::spawn(SimulatedCollector::new(0.5), options);
    let scheduler = TelemetryScheduler::new(
        vec!["a".to_string(), "b".to_string(), "c".to_string()],
        Duration::from_secs(60),
    );

    for task in scheduler.batch() {
        pool.send(task).await.unwrap();
    }

    eventually(|| pool.stats().succeeded == 9).await;
    let stats = pool.stats();
    assert_eq!(stats.attempts, stats.succeeded + stats.failed);
    assert_eq!(stats.requeued, stats.failed);

    pool.shutdown();
}
