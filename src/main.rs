//! Process wiring for the `arc-scheduler` binary: construct the state mirror,
//! schema registry, and transport components; start the telemetry, request,
//! and retry consumer loops; wait for a shutdown signal; close every
//! resource deterministically on every exit path.

use arc_scheduler::config::{Args, SchedulerConfig};
use arc_scheduler::error::TransportError;
use arc_scheduler::kafka_transport::{KafkaConsumer, KafkaProducer};
use arc_scheduler::model::{topics, TelemetryRecord};
use arc_scheduler::schema::SchemaRegistry;
use arc_scheduler::scheduler::{
    DispatchRouter, Scheduler, SchedulerConfig as SchedulerRuntimeConfig,
};
use arc_scheduler::state::StateMirror;
use arc_scheduler::transport::{Consumer, ConsumedRecord, Producer, TransportStats};

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match SchedulerConfig::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::from(0),
        Err(RunError::Transport(e)) => {
            tracing::error!(error = %e, "unrecoverable bus failure");
            ExitCode::from(2)
        }
    }
}

async fn run(config: SchedulerConfig) -> Result<(), RunError> {
    let registry = Arc::new(SchemaRegistry::with_builtin_schemas());
    let stats = Arc::new(TransportStats::default());
    let mirror = Arc::new(StateMirror::new(
        config.staleness_threshold_s,
        config.max_gpu_utilization,
    ));

    let bus_producer: Arc<dyn Producer> = Arc::new(KafkaProducer::new(
        &config.bootstrap_servers,
        registry.clone(),
        stats.clone(),
    )?);
    let dead_letter: Option<Arc<dyn Producer>> = if config.dead_letter_enabled {
        Some(Arc::new(KafkaProducer::new(
            &config.bootstrap_servers,
            registry.clone(),
            stats.clone(),
        )?))
    } else {
        None
    };

    let telemetry_consumer = KafkaConsumer::new(
        &config.bootstrap_servers,
        &config.group_id,
        topics::TELEMETRY,
        registry.clone(),
        stats.clone(),
        dead_letter.clone(),
    )?;
    let request_consumer = KafkaConsumer::new(
        &config.bootstrap_servers,
        &config.group_id,
        topics::REQUEST,
        registry.clone(),
        stats.clone(),
        dead_letter.clone(),
    )?;
    let retry_consumer = KafkaConsumer::new(
        &config.bootstrap_servers,
        &format!("{}-retry", config.group_id),
        topics::RETRY,
        registry.clone(),
        stats.clone(),
        dead_letter.clone(),
    )?;

    let router = Arc::new(DispatchRouter::new(bus_producer.clone()));
    let scheduler = Arc::new(Scheduler::new(
        mirror.clone(),
        SchedulerRuntimeConfig {
            max_retries: config.max_retries,
            base_backoff_ms: config.base_backoff_ms,
            reservation_ttl_s: config.reservation_ttl_s,
            max_concurrency: config.max_concurrency,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tracing::info!(
        geozone_id = %config.geozone_id,
        group_id = %config.group_id,
        bootstrap_servers = %config.bootstrap_servers,
        "arc-scheduler starting"
    );

    let telemetry_task = tokio::spawn(run_telemetry_loop(
        mirror.clone(),
        telemetry_consumer,
        config.poll_timeout,
        shutdown_rx.clone(),
    ));
    let request_task = tokio::spawn(run_request_loop(
        scheduler.clone(),
        request_consumer,
        router.clone(),
        bus_producer.clone(),
        config.poll_timeout,
        shutdown_rx.clone(),
    ));
    let retry_task = tokio::spawn(run_retry_loop(
        scheduler.clone(),
        retry_consumer,
        router.clone(),
        bus_producer.clone(),
        config.poll_timeout,
        shutdown_rx.clone(),
    ));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received; draining consumer loops");
    let _ = shutdown_tx.send(true);

    let (telemetry_result, request_result, retry_result) =
        tokio::join!(telemetry_task, request_task, retry_task);

    telemetry_result.expect("telemetry loop task panicked")?;
    request_result.expect("request loop task panicked")?;
    retry_result.expect("retry loop task panicked")?;

    bus_producer.close().await?;
    if let Some(dl) = &dead_letter {
        dl.close().await?;
    }

    tracing::info!("arc-scheduler shut down cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Consumes the telemetry stream, projecting each valid record into the
/// state mirror. Invalid records were already dead-lettered by
/// the consumer on the way in.
async fn run_telemetry_loop(
    mirror: Arc<StateMirror>,
    mut consumer: KafkaConsumer,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            records = consumer.poll(poll_timeout) => {
                for record in records? {
                    if let ConsumedRecord::Valid { data, .. } = record {
                        if let Ok(telemetry) = serde_json::from_value::<TelemetryRecord>(data) {
                            mirror.upsert_telemetry(telemetry);
                        }
                    }
                }
                consumer.commit().await?;
            }
        }
    }
    consumer.close().await
}

/// Consumes the inference-request stream, scheduling each valid request
/// and committing only after the whole batch has been handled.
async fn run_request_loop(
    scheduler: Arc<Scheduler>,
    mut consumer: KafkaConsumer,
    router: Arc<DispatchRouter>,
    producer: Arc<dyn Producer>,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = scheduler.run_request_batch(
                &mut consumer,
                router.as_ref(),
                producer.as_ref(),
                producer.as_ref(),
                poll_timeout,
            ) => {
                result?;
            }
        }
    }
    consumer.close().await
}

/// Consumes the retry stream, re-delaying records whose `next_retry_at`
/// hasn't elapsed and rescheduling the rest.
async fn run_retry_loop(
    scheduler: Arc<Scheduler>,
    mut consumer: KafkaConsumer,
    router: Arc<DispatchRouter>,
    producer: Arc<dyn Producer>,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = scheduler.run_retry_batch(
                &mut consumer,
                router.as_ref(),
                producer.as_ref(),
                producer.as_ref(),
                poll_timeout,
            ) => {
                result?;
            }
        }
    }
    consumer.close().await
}
