//! Tributary: event ingestion with an at-least-once durable channel.
//!
//! # Usage
//!
//! ```bash
//! tributary --data-dir ./data ingest --port 8080
//! tributary --data-dir ./data worker --health-port 8081 --concurrency 8
//! tributary --data-dir ./data standalone
//! ```
//!
//! Environment variables can also be used:
//! - `TRIBUTARY_DATA_DIR`: Data directory for the channel and analytics databases
//! - `PUBSUB_TOPIC` / `PUBSUB_SUBSCRIPTION`: Channel names
//! - `HTTP_PORT`: Ingest API port
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use tokio_util::sync::CancellationToken;
use tributary::config::{Cli, Command};
use tributary::observability::metrics::init_metrics_with_endpoint;
use tributary::observability::tracing::init_tracing;
use tributary::server;

/// Print startup banner with version and configuration.
fn print_banner(cli: &Cli) {
    let version = env!("CARGO_PKG_VERSION");
    let role = match &cli.command {
        Command::Ingest(args) => format!("ingest (port {})", args.port),
        Command::Worker(args) => format!("worker (health port {})", args.health_port),
        Command::Standalone(args) => format!(
            "standalone (port {}, health port {})",
            args.ingest.port, args.worker.health_port
        ),
    };
    eprintln!(
        r#"
  Tributary v{version}

  Configuration:
    Role:          {role}
    Host:          {}
    Data Dir:      {}
    Topic:         {}
    Subscription:  {}
    Log Level:     {}

  Press Ctrl+C to shutdown gracefully.
"#,
        cli.common.host,
        cli.common.data_dir.display(),
        cli.common.topic,
        cli.common.subscription,
        cli.common.log_level
    );
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating shutdown...");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = ctrl_c.await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }

        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let cli = Cli::parse_args();

    init_tracing("tributary", &cli.common.log_level, cli.common.log_format);

    // Initialize metrics (with optional OTLP export)
    init_metrics_with_endpoint(cli.common.otel_endpoint.as_deref());

    print_banner(&cli);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    server::run(cli, shutdown).await?;

    tracing::info!("Tributary shutdown complete");
    Ok(())
}
