//! Test utilities for Tributary integration tests.
//!
//! Provides:
//! - A temporary data directory fixture
//! - An in-process pipeline (channel, analytics store, producer, blob sink)
//! - A blob sink wrapper that fails on demand

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tributary::analytics::SqliteWarehouse;
use tributary::channel::{RedeliveryPolicy, SqliteChannel, SqliteChannelConfig};
use tributary::consumer::{ConsumerConfig, ConsumerError, ConsumerLoop, EnvelopeProcessor};
use tributary::observability::MetricsRegister;
use tributary::producer::{Producer, ProducerConfig};
use tributary::sink::{BlobSink, FsBlobSink, SinkError};

pub const TOPIC: &str = "events";
pub const SUBSCRIPTION: &str = "events-worker";
pub const TABLE: &str = "events";

/// Test fixture that manages a temporary data directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    pub temp_dir: TempDir,
    pub channel_path: PathBuf,
    pub analytics_path: PathBuf,
    pub blob_root: PathBuf,
}

impl TestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let channel_path = temp_dir.path().join("channel.db");
        let analytics_path = temp_dir.path().join("analytics.db");
        let blob_root = temp_dir.path().join("blobs");
        Self {
            temp_dir,
            channel_path,
            analytics_path,
            blob_root,
        }
    }

    /// Channel tuning with short leases and backoff so redelivery is observable.
    pub fn channel_config() -> SqliteChannelConfig {
        SqliteChannelConfig {
            ack_deadline: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            redelivery: RedeliveryPolicy {
                min_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
            ..SqliteChannelConfig::default()
        }
    }

    pub async fn open_channel(&self) -> Arc<SqliteChannel> {
        let channel = SqliteChannel::open(&self.channel_path, Self::channel_config())
            .expect("failed to open channel");
        channel
            .create_subscription(TOPIC, SUBSCRIPTION)
            .await
            .expect("failed to create subscription");
        Arc::new(channel)
    }

    pub fn producer(&self, channel: Arc<SqliteChannel>) -> Arc<Producer> {
        let warehouse =
            SqliteWarehouse::open(&self.analytics_path, 2).expect("failed to open warehouse");
        Arc::new(Producer::new(
            channel,
            Arc::new(warehouse),
            ProducerConfig {
                topic: TOPIC.to_string(),
                table: TABLE.to_string(),
                publish_timeout: Duration::from_secs(5),
            },
        ))
    }

    pub fn sink(&self) -> FsBlobSink {
        FsBlobSink::new(&self.blob_root)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A running consumer loop.
pub struct RunningWorker {
    pub register: Arc<MetricsRegister>,
    pub cancel: CancellationToken,
    pub task: tokio::task::JoinHandle<Result<(), ConsumerError>>,
}

impl RunningWorker {
    pub fn start(
        channel: Arc<SqliteChannel>,
        sink: Arc<dyn BlobSink>,
        concurrency: u32,
    ) -> Self {
        let register = Arc::new(MetricsRegister::new());
        let processor =
            EnvelopeProcessor::new(sink, Arc::clone(&register), SUBSCRIPTION.to_string());
        let consumer = ConsumerLoop::new(
            channel,
            processor,
            Arc::clone(&register),
            ConsumerConfig {
                subscription: SUBSCRIPTION.to_string(),
                concurrency,
                grace_period: Duration::from_secs(2),
            },
        );
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { consumer.run(token).await });
        Self {
            register,
            cancel,
            task,
        }
    }

    pub async fn stop(self) -> Result<(), ConsumerError> {
        self.cancel.cancel();
        self.task.await.expect("consumer task panicked")
    }
}

/// Blob sink that fails the first `failures` puts, then delegates.
pub struct FlakySink {
    inner: FsBlobSink,
    remaining_failures: AtomicUsize,
    pub puts: AtomicUsize,
}

impl FlakySink {
    pub fn new(inner: FsBlobSink, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
            puts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BlobSink for FlakySink {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SinkError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SinkError> {
        self.inner.get(key).await
    }
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met, `false` if the timeout expired.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
