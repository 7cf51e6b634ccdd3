//! Process lifecycle for each role.
//!
//! Every role opens the embedded channel, makes sure the worker
//! subscription exists (so events published before the first worker start
//! are retained for it), runs until shutdown, and closes the channel.

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::analytics::SqliteWarehouse;
use crate::assistant::{Assistant, HttpTextGenerator, TextGenerator};
use crate::channel::SqliteChannel;
use crate::config::{Cli, Command, CommonArgs, IngestArgs, StandaloneArgs, WorkerArgs};
use crate::consumer::{ConsumerConfig, ConsumerLoop, EnvelopeProcessor};
use crate::http::{self, health, ingest};
use crate::observability::MetricsRegister;
use crate::producer::{Producer, ProducerConfig};
use crate::sink::FsBlobSink;

/// Run the configured role until `shutdown` is cancelled.
///
/// Returns an error if startup fails or the worker's consumer loop hits a
/// transport error, so the process exits non-zero for its supervisor.
pub async fn run(cli: Cli, shutdown: CancellationToken) -> anyhow::Result<()> {
    let Cli {
        common,
        channel: channel_args,
        command,
    } = cli;

    std::fs::create_dir_all(&common.data_dir).with_context(|| {
        format!("failed to create data directory {}", common.data_dir.display())
    })?;

    let channel = Arc::new(
        SqliteChannel::open(common.channel_db_path(), channel_args.channel_config())
            .context("failed to open channel")?,
    );
    channel
        .create_subscription(&common.topic, &common.subscription)
        .await
        .context("failed to create subscription")?;

    let result = match command {
        Command::Ingest(args) => run_ingest(&common, Arc::clone(&channel), args, shutdown).await,
        Command::Worker(args) => run_worker(&common, Arc::clone(&channel), args, shutdown).await,
        Command::Standalone(args) => {
            run_standalone(&common, Arc::clone(&channel), args, shutdown).await
        }
    };

    if let Err(e) = channel.close().await {
        tracing::warn!(error = %e, "Channel did not close cleanly");
    }
    result
}

/// Run the ingest API and the worker side by side.
///
/// A failure in either role stops the other. The worker's error is
/// reported first.
pub async fn run_standalone(
    common: &CommonArgs,
    channel: Arc<SqliteChannel>,
    args: StandaloneArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let StandaloneArgs {
        ingest: ingest_args,
        worker: worker_args,
    } = args;

    let ingest_role = async {
        let result = run_ingest(common, Arc::clone(&channel), ingest_args, shutdown.clone()).await;
        if result.is_err() {
            shutdown.cancel();
        }
        result
    };
    let worker_role = async {
        let result = run_worker(common, Arc::clone(&channel), worker_args, shutdown.clone()).await;
        if result.is_err() {
            shutdown.cancel();
        }
        result
    };

    let (ingest_result, worker_result) = tokio::join!(ingest_role, worker_role);
    worker_result.and(ingest_result)
}

/// Serve the ingest API until shutdown.
pub async fn run_ingest(
    common: &CommonArgs,
    channel: Arc<SqliteChannel>,
    args: IngestArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let warehouse = SqliteWarehouse::open(args.analytics_db_path(&common.data_dir), 4)
        .context("failed to open analytical store")?;

    let producer = Producer::new(
        channel,
        Arc::new(warehouse),
        ProducerConfig {
            topic: common.topic.clone(),
            table: args.table.clone(),
            publish_timeout: args.publish_timeout(),
        },
    );

    let client = reqwest::Client::new();
    let generator = args.text_generator_url.as_ref().map(|url| {
        Arc::new(HttpTextGenerator::new(client.clone(), url.clone())) as Arc<dyn TextGenerator>
    });
    if generator.is_none() {
        tracing::info!("No text generator configured, /chat is disabled");
    }
    let assistant = Assistant::new(generator, args.worker_metrics_url.clone(), client);

    let router = ingest::create_router(ingest::IngestState::new(
        Arc::new(producer),
        Arc::new(assistant),
    ));
    let addr = common.socket_addr(args.port)?;
    let (_, server) = http::serve("ingest", addr, router, shutdown)
        .await
        .with_context(|| format!("failed to bind ingest API on {addr}"))?;

    server.await.context("ingest API task failed")??;
    Ok(())
}

/// Run the consumer loop with its health server until shutdown.
pub async fn run_worker(
    common: &CommonArgs,
    channel: Arc<SqliteChannel>,
    args: WorkerArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let register = Arc::new(MetricsRegister::new());

    let blob_root = args.blob_root(&common.data_dir);
    tracing::info!(path = %blob_root.display(), "Blob sink ready");
    let processor = EnvelopeProcessor::new(
        Arc::new(FsBlobSink::new(blob_root)),
        Arc::clone(&register),
        common.subscription.clone(),
    );

    // The health server outlives the consumer until the process stops.
    let http_shutdown = CancellationToken::new();
    let addr = common.socket_addr(args.health_port)?;
    let (_, health_server) = http::serve(
        "health",
        addr,
        health::create_router(Arc::clone(&register)),
        http_shutdown.clone(),
    )
    .await
    .with_context(|| format!("failed to bind health server on {addr}"))?;

    let consumer = ConsumerLoop::new(
        channel,
        processor,
        Arc::clone(&register),
        ConsumerConfig {
            subscription: common.subscription.clone(),
            concurrency: args.concurrency,
            grace_period: args.grace_period(),
        },
    );
    let result = consumer.run(shutdown).await;

    http_shutdown.cancel();
    if let Err(e) = health_server.await {
        tracing::warn!(error = %e, "Health server task failed");
    }

    let snapshot = register.snapshot();
    tracing::info!(
        total_processed = snapshot.total_processed,
        total_errors = snapshot.total_errors,
        status = ?snapshot.status,
        "Worker finished"
    );
    result.context("consumer loop failed")
}
