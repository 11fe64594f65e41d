use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use rand::Rng;
use telemetry_pipeline::{
    TelemetryData, TelemetryTask,
    alarm::{AlarmHandle, LoggingActuator, WebhookActuator},
    bus::{InMemoryBus, Message, MessageBus},
    config::{Config, read_config_file},
    consumers::{AlertsClient, ConsumerGroups, ReportConsumers, TracingAlerts, TracingLogger, WebhookAlerts},
    device::{LoggingDeviceClient, NetworkHandler, StaticRepository},
    ingest::IngestGateway,
    pool::{DeadLetter, WorkerPool},
    telemetry::{SimulatedCollector, TelemetryScheduler},
    util::{get_config_path, get_log_level, parse_log_level},
};
use tokio::spawn;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (falls back to PIPELINE_CONFIG, then built-in defaults)
    #[arg(short)]
    file: Option<String>,

    /// Log level, overrides -v and PIPELINE_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,

    /// Configure and monitor these devices before starting the pipeline
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Publish simulated power readings and error reports
    #[arg(long)]
    demo: bool,
}

impl Args {
    fn level(&self) -> LevelFilter {
        if let Some(level) = &self.log_level {
            return parse_log_level(level);
        }

        match self.verbose {
            0 => get_log_level(),
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("telemetry_pipeline", level),
        ("telemetry_hub", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.level());
    trace!("started with args: {args:?}");

    let config = match args.file.clone().or_else(get_config_path) {
        Some(path) => read_config_file(&path)?,
        None => {
            debug!("no config file given, using defaults");
            Config::default()
        }
    };

    configure_devices(&args.devices).await?;

    let bus = InMemoryBus::new(config.bus.options());
    let cancel = CancellationToken::new();

    // Worker pool fed by the periodic scheduler
    let (pool, dead_letters) =
        WorkerPool::spawn(SimulatedCollector::default(), config.pool.options());
    spawn(log_dead_letters(dead_letters));

    let scheduler = TelemetryScheduler::new(
        config.scheduler.devices.clone(),
        config.scheduler.interval(),
    );
    let scheduler_task = spawn(scheduler.run(pool.clone(), cancel.child_token()));

    // Alarm supervisor on the transceiver topic
    let alarm = match &config.alarm.webhook {
        Some(url) => {
            AlarmHandle::spawn_with_token(
                &bus,
                &config.alarm.topic,
                &config.alarm.group,
                WebhookActuator::new(url)?,
                config.alarm.threshold,
                cancel.child_token(),
            )
            .await?
        }
        None => {
            AlarmHandle::spawn_with_token(
                &bus,
                &config.alarm.topic,
                &config.alarm.group,
                LoggingActuator,
                config.alarm.threshold,
                cancel.child_token(),
            )
            .await?
        }
    };
    spawn(log_alarm_transitions(alarm.clone()));

    // Alert and log groups on the error report topic
    let alerts: Arc<dyn AlertsClient> = match &config.consumers.alert_webhook {
        Some(url) => Arc::new(WebhookAlerts::new(url)?),
        None => Arc::new(TracingAlerts),
    };
    let groups = ConsumerGroups {
        topic: config.ingest.topic.clone(),
        alert_group: config.consumers.alert_group.clone(),
        log_group: config.consumers.log_group.clone(),
    };
    let consumers =
        ReportConsumers::spawn(&bus, &groups, alerts, TracingLogger, cancel.child_token()).await?;

    if args.demo {
        let gateway = IngestGateway::new(
            bus.clone(),
            config.ingest.topic.clone(),
            config.ingest.high_watermark,
        );
        spawn(demo_traffic(
            bus.clone(),
            gateway,
            config.alarm.topic.clone(),
            cancel.child_token(),
        ));
    }

    info!("telemetry pipeline running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    cancel.cancel();
    pool.shutdown();

    alarm.join().await;
    consumers.join().await;
    pool.join().await;

    match scheduler_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("telemetry scheduler stopped early: {e}"),
        Err(e) => error!("telemetry scheduler panicked: {e}"),
    }

    bus.close();
    info!(stats = ?pool.stats(), "pipeline stopped");

    Ok(())
}

#[instrument(skip_all)]
async fn configure_devices(devices: &[String]) -> anyhow::Result<()> {
    if devices.is_empty() {
        return Ok(());
    }

    let handler = NetworkHandler::new(StaticRepository, LoggingDeviceClient, LoggingDeviceClient);
    for ip in devices {
        handler
            .perform_network_operation(ip)
            .await
            .with_context(|| format!("network operation on {ip} failed"))?;
    }

    Ok(())
}

async fn log_dead_letters(mut dead_letters: UnboundedReceiver<DeadLetter<TelemetryTask>>) {
    while let Some(letter) = dead_letters.recv().await {
        error!(
            device = %letter.task.device_id,
            data_type = %letter.task.data_type,
            attempts = letter.attempts,
            "telemetry task abandoned: {}",
            letter.error
        );
    }
}

async fn log_alarm_transitions(alarm: AlarmHandle) {
    let mut watch = alarm.watch();
    while let Some(state) = watch.changed().await {
        info!(%state, "alarm state changed");
    }
}

#[instrument(skip_all)]
async fn demo_traffic(
    bus: InMemoryBus,
    gateway: IngestGateway<InMemoryBus>,
    alarm_topic: String,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (reading, report) = {
            let mut rng = rand::thread_rng();
            let reading: f64 = rng.gen_range(-50.0..-30.0);
            let report = TelemetryData {
                hostname: format!("edge-{}", rng.gen_range(1..=3)),
                interface: format!("xe-0/0/{}", rng.gen_range(0..8)),
                input_errors: rng.gen_range(1..20_000),
            };
            (reading, report)
        };

        if let Err(e) = bus
            .publish(&alarm_topic, Message::new(format!("{reading:.1}")))
            .await
        {
            warn!("failed to publish power reading: {e}");
        }

        match gateway.ingest(&report).await {
            Ok(admission) => trace!(?admission, "demo report ingested"),
            Err(e) => warn!("failed to ingest demo report: {e}"),
        }
    }

    debug!("demo traffic stopped");
}
