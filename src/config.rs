//! Configuration parsing for Tributary.
//!
//! Supports:
//! - CLI arguments via clap, one subcommand per process role
//! - Environment variable overrides (including the Pub/Sub and BigQuery
//!   style names the deployment manifests already set)
//! - Sensible defaults for quick start

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{RedeliveryPolicy, SqliteChannelConfig};
use crate::observability::tracing::LogFormat;
use crate::storage::batch::BatchConfig;

/// Tributary: event ingestion with an at-least-once durable channel.
#[derive(Parser, Debug, Clone)]
#[command(name = "tributary")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub channel: ChannelArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the ingest API (producer side)
    Ingest(IngestArgs),
    /// Run the consumer loop and its health server
    Worker(WorkerArgs),
    /// Run ingest API and worker in one process
    Standalone(StandaloneArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Host address to bind HTTP servers to
    #[arg(long, env = "TRIBUTARY_HOST", default_value = "0.0.0.0", global = true)]
    pub host: String,

    /// Data directory for the channel and analytics databases
    #[arg(short, long, env = "TRIBUTARY_DATA_DIR", default_value = "./data", global = true)]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format
    #[arg(
        long,
        env = "TRIBUTARY_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    pub log_format: LogFormat,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", global = true)]
    pub otel_endpoint: Option<String>,

    /// Topic events are published to
    #[arg(long, env = "PUBSUB_TOPIC", default_value = "events", global = true)]
    pub topic: String,

    /// Subscription the worker consumes
    #[arg(long, env = "PUBSUB_SUBSCRIPTION", default_value = "events-worker", global = true)]
    pub subscription: String,
}

/// Embedded channel tuning.
#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// Seconds a delivery stays leased before it is redelivered
    #[arg(long, env = "TRIBUTARY_ACK_DEADLINE_SECS", default_value_t = 30, global = true)]
    pub ack_deadline_secs: u64,

    /// Minimum redelivery delay after a nack
    #[arg(long, env = "TRIBUTARY_MIN_BACKOFF_MS", default_value_t = 1000, global = true)]
    pub min_backoff_ms: u64,

    /// Maximum redelivery delay after a nack
    #[arg(long, env = "TRIBUTARY_MAX_BACKOFF_MS", default_value_t = 600_000, global = true)]
    pub max_backoff_ms: u64,

    /// Idle poll interval for deliveries published by other processes
    #[arg(long, env = "TRIBUTARY_POLL_INTERVAL_MS", default_value_t = 500, global = true)]
    pub poll_interval_ms: u64,

    /// Size of the write channel (backpressure control)
    #[arg(long, env = "TRIBUTARY_WRITE_CHANNEL_SIZE", default_value_t = 1000, global = true)]
    pub write_channel_size: usize,

    /// Size of the reader connection pool
    #[arg(long, env = "TRIBUTARY_READER_POOL_SIZE", default_value_t = 4, global = true)]
    pub reader_pool_size: u32,

    /// Size of the notification channel
    #[arg(long, env = "TRIBUTARY_NOTIFY_CHANNEL_SIZE", default_value_t = 1024, global = true)]
    pub notify_channel_size: usize,

    /// Maximum publishes per group commit
    #[arg(long, env = "TRIBUTARY_BATCH_SIZE", default_value_t = 100, global = true)]
    pub batch_size: usize,

    /// Maximum wait for a group commit to fill
    #[arg(long, env = "TRIBUTARY_BATCH_DELAY_MS", default_value_t = 5, global = true)]
    pub batch_delay_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Port for the ingest API
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Analytics dataset (stored as `<data-dir>/<dataset>.db`)
    #[arg(long, env = "BQ_DATASET", default_value = "analytics")]
    pub dataset: String,

    /// Table receiving event rows
    #[arg(long, env = "TRIBUTARY_EVENTS_TABLE", default_value = "events")]
    pub table: String,

    /// How long to wait for the channel to confirm a publish
    #[arg(long, env = "TRIBUTARY_PUBLISH_TIMEOUT_MS", default_value_t = 10_000)]
    pub publish_timeout_ms: u64,

    /// Text-generation endpoint for `/chat` (disabled when unset)
    #[arg(long, env = "TRIBUTARY_TEXT_GENERATOR_URL")]
    pub text_generator_url: Option<String>,

    /// Worker `/metrics` URL quoted to the assistant
    #[arg(long, env = "TRIBUTARY_WORKER_METRICS_URL")]
    pub worker_metrics_url: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Port for the worker health/metrics server
    #[arg(long, env = "TRIBUTARY_HEALTH_PORT", default_value_t = 8081)]
    pub health_port: u16,

    /// Blob sink root (defaults to `<data-dir>/blobs`)
    #[arg(long, env = "TRIBUTARY_BLOB_DIR")]
    pub blob_dir: Option<PathBuf>,

    /// Worker count and outstanding-delivery limit
    #[arg(
        long,
        env = "TRIBUTARY_CONCURRENCY",
        default_value_t = 8,
        value_parser = clap::value_parser!(u32).range(1..=1024)
    )]
    pub concurrency: u32,

    /// Seconds in-flight deliveries may run after shutdown begins
    #[arg(long, env = "TRIBUTARY_GRACE_PERIOD_SECS", default_value_t = 10)]
    pub grace_period_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StandaloneArgs {
    #[command(flatten)]
    pub ingest: IngestArgs,

    #[command(flatten)]
    pub worker: WorkerArgs,
}

impl Cli {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl CommonArgs {
    pub fn channel_db_path(&self) -> PathBuf {
        self.data_dir.join("channel.db")
    }

    pub fn socket_addr(&self, port: u16) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, port).parse()
    }
}

impl ChannelArgs {
    pub fn channel_config(&self) -> SqliteChannelConfig {
        SqliteChannelConfig {
            ack_deadline: Duration::from_secs(self.ack_deadline_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            redelivery: RedeliveryPolicy {
                min_backoff: Duration::from_millis(self.min_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
            },
            batch: BatchConfig::from_config(self.batch_size, self.batch_delay_ms),
            write_channel_size: self.write_channel_size,
            reader_pool_size: self.reader_pool_size,
            notify_channel_size: self.notify_channel_size,
        }
    }
}

impl IngestArgs {
    pub fn analytics_db_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.db", self.dataset))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl WorkerArgs {
    pub fn blob_root(&self, data_dir: &Path) -> PathBuf {
        self.blob_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("blobs"))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
