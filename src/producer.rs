//! Event submission.
//!
//! The channel publish is the commit point of [`Producer::submit`]. The
//! analytics write that follows is best effort: its failures are logged and
//! counted, and reported on the receipt, but never fail the submission.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::analytics::{event_row, AnalyticalStore, RowError};
use crate::channel::{ChannelError, DurableChannel};
use crate::event::{EventRecord, NewEvent};
use crate::observability::metrics::{record_analytics_failure, record_publish_failure};
use crate::{generate_event_id, now_millis};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// What happened to the secondary analytics write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsOutcome {
    Stored,
    /// The store rejected the row.
    Rejected(Vec<RowError>),
    /// The store could not be reached.
    Failed(String),
}

impl AnalyticsOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub event_id: String,
    /// Channel message id; the consumer keys its blob by this.
    pub delivery_id: String,
    pub analytics: AnalyticsOutcome,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub topic: String,
    pub table: String,
    /// Upper bound on waiting for the channel's durable confirmation.
    pub publish_timeout: Duration,
}

/// Submission counters served on the ingest `/metrics` endpoint.
#[derive(Debug, Default)]
pub struct PublishStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    analytics_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishStatsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub analytics_failures: u64,
}

impl PublishStats {
    pub fn snapshot(&self) -> PublishStatsSnapshot {
        PublishStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            analytics_failures: self.analytics_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct Producer {
    channel: Arc<dyn DurableChannel>,
    analytics: Arc<dyn AnalyticalStore>,
    config: ProducerConfig,
    stats: PublishStats,
}

impl Producer {
    pub fn new(
        channel: Arc<dyn DurableChannel>,
        analytics: Arc<dyn AnalyticalStore>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            channel,
            analytics,
            config,
            stats: PublishStats::default(),
        }
    }

    pub fn stats(&self) -> PublishStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn analytics(&self) -> &Arc<dyn AnalyticalStore> {
        &self.analytics
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Publish an event and mirror it into the analytical store.
    ///
    /// Fails only if the event is invalid or the channel does not confirm
    /// the publish in time. A caller that retries after a timeout may
    /// publish the event twice.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, event_id))]
    pub async fn submit(&self, event: NewEvent) -> Result<SubmitReceipt, ProducerError> {
        if event.event_type.trim().is_empty() {
            return Err(ProducerError::InvalidEvent("event type cannot be empty".into()));
        }

        let record = EventRecord::assign(event, generate_event_id(), now_millis());
        tracing::Span::current().record("event_id", record.event_id.as_str());
        let payload = record.to_wire()?;

        let attributes = HashMap::from([
            ("event_id".to_string(), record.event_id.clone()),
            ("event_type".to_string(), record.event_type.clone()),
        ]);

        let publish = self
            .channel
            .publish(&self.config.topic, payload, attributes);
        let receipt = match tokio::time::timeout(self.config.publish_timeout, publish).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => return Err(self.publish_failed(e)),
            Err(_) => {
                let timeout = ChannelError::Timeout(self.config.publish_timeout);
                return Err(self.publish_failed(timeout));
            }
        };
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        tracing::info!(delivery_id = %receipt.message_id, "Event published");

        let analytics = self.write_analytics(&record).await;

        Ok(SubmitReceipt {
            event_id: record.event_id,
            delivery_id: receipt.message_id,
            analytics,
        })
    }

    fn publish_failed(&self, error: ChannelError) -> ProducerError {
        self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
        record_publish_failure(&self.config.topic);
        tracing::warn!(topic = %self.config.topic, error = %error, "Publish failed");
        ProducerError::Channel(error)
    }

    async fn write_analytics(&self, record: &EventRecord) -> AnalyticsOutcome {
        let outcome = match self
            .analytics
            .insert_row(&self.config.table, event_row(record))
            .await
        {
            Ok(errors) if errors.is_empty() => return AnalyticsOutcome::Stored,
            Ok(errors) => {
                tracing::error!(
                    table = %self.config.table,
                    errors = ?errors,
                    "Analytics insert rejected row"
                );
                AnalyticsOutcome::Rejected(errors)
            }
            Err(e) => {
                tracing::error!(table = %self.config.table, error = %e, "Analytics insert failed");
                AnalyticsOutcome::Failed(e.to_string())
            }
        };

        self.stats.analytics_failures.fetch_add(1, Ordering::Relaxed);
        record_analytics_failure(&self.config.table);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{AnalyticsError, EventSummary, SqliteWarehouse, EVENTS_TABLE};
    use crate::channel::{PublishReceipt, SqliteChannel, SqliteChannelConfig, Subscription};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Map, Value};
    use tempfile::TempDir;

    struct UnavailableChannel;

    #[async_trait]
    impl DurableChannel for UnavailableChannel {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _attributes: HashMap<String, String>,
        ) -> Result<PublishReceipt, ChannelError> {
            Err(ChannelError::Unavailable("connection refused".into()))
        }

        async fn subscribe(&self, name: &str, _limit: u32) -> Result<Subscription, ChannelError> {
            Err(ChannelError::SubscriptionNotFound(name.into()))
        }
    }

    struct StalledChannel;

    #[async_trait]
    impl DurableChannel for StalledChannel {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _attributes: HashMap<String, String>,
        ) -> Result<PublishReceipt, ChannelError> {
            std::future::pending().await
        }

        async fn subscribe(&self, name: &str, _limit: u32) -> Result<Subscription, ChannelError> {
            Err(ChannelError::SubscriptionNotFound(name.into()))
        }
    }

    struct DownStore;

    #[async_trait]
    impl AnalyticalStore for DownStore {
        async fn insert_row(
            &self,
            _table: &str,
            _row: Map<String, Value>,
        ) -> Result<Vec<RowError>, AnalyticsError> {
            Err(AnalyticsError::Unavailable("warehouse offline".into()))
        }

        async fn recent_events(
            &self,
            _table: &str,
            _limit: usize,
        ) -> Result<Vec<EventSummary>, AnalyticsError> {
            Err(AnalyticsError::Unavailable("warehouse offline".into()))
        }
    }

    fn config() -> ProducerConfig {
        ProducerConfig {
            topic: "events".into(),
            table: EVENTS_TABLE.into(),
            publish_timeout: Duration::from_millis(200),
        }
    }

    fn click() -> NewEvent {
        NewEvent::new("click", json!({"x": 1}).as_object().unwrap().clone())
    }

    async fn sqlite_channel(dir: &TempDir) -> Arc<SqliteChannel> {
        let channel =
            SqliteChannel::open(dir.path().join("channel.db"), SqliteChannelConfig::default())
                .unwrap();
        channel.create_subscription("events", "workers").await.unwrap();
        Arc::new(channel)
    }

    #[tokio::test]
    async fn test_submit_publishes_and_stores_row() {
        let dir = TempDir::new().unwrap();
        let channel = sqlite_channel(&dir).await;
        let store = Arc::new(SqliteWarehouse::open(dir.path().join("analytics.db"), 2).unwrap());
        let producer = Producer::new(channel.clone(), store.clone(), config());

        let receipt = producer.submit(click().with_user("u1")).await.unwrap();
        assert!(receipt.analytics.is_stored());

        let mut sub = channel.subscribe("workers", 1).await.unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope.delivery_id(), receipt.delivery_id);
        assert_eq!(envelope.attribute("event_id"), Some(receipt.event_id.as_str()));
        assert_eq!(envelope.attribute("event_type"), Some("click"));

        let record = EventRecord::from_wire(envelope.data()).unwrap();
        assert_eq!(record.event_id, receipt.event_id);
        assert_eq!(record.user_id.as_deref(), Some("u1"));
        assert_eq!(record.payload["x"], 1);

        let rows = store.recent_events(EVENTS_TABLE, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, receipt.event_id);

        assert_eq!(
            producer.stats(),
            PublishStatsSnapshot {
                published: 1,
                publish_failures: 0,
                analytics_failures: 0,
            }
        );
        envelope.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_analytics_failure_does_not_fail_submit() {
        let dir = TempDir::new().unwrap();
        let channel = sqlite_channel(&dir).await;
        let producer = Producer::new(channel.clone(), Arc::new(DownStore), config());

        let receipt = producer.submit(click()).await.unwrap();
        assert!(matches!(receipt.analytics, AnalyticsOutcome::Failed(_)));
        assert_eq!(channel.backlog("workers").await.unwrap(), 1);

        let stats = producer.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.analytics_failures, 1);
    }

    #[tokio::test]
    async fn test_channel_unavailable_fails_without_analytics_write() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteWarehouse::open(dir.path().join("analytics.db"), 2).unwrap());
        let producer = Producer::new(Arc::new(UnavailableChannel), store.clone(), config());

        let result = producer.submit(click()).await;
        assert!(matches!(
            result,
            Err(ProducerError::Channel(ChannelError::Unavailable(_)))
        ));
        assert!(store.recent_events(EVENTS_TABLE, 10).await.unwrap().is_empty());
        assert_eq!(producer.stats().publish_failures, 1);
    }

    #[tokio::test]
    async fn test_publish_timeout() {
        let producer = Producer::new(Arc::new(StalledChannel), Arc::new(DownStore), config());

        let result = producer.submit(click()).await;
        assert!(matches!(
            result,
            Err(ProducerError::Channel(ChannelError::Timeout(_)))
        ));
        assert_eq!(producer.stats().published, 0);
    }

    #[tokio::test]
    async fn test_empty_event_type_is_invalid() {
        let producer = Producer::new(Arc::new(UnavailableChannel), Arc::new(DownStore), config());

        let result = producer.submit(NewEvent::new("  ", Map::new())).await;
        assert!(matches!(result, Err(ProducerError::InvalidEvent(_))));
        assert_eq!(producer.stats().publish_failures, 0);
    }

    #[tokio::test]
    async fn test_event_ids_are_unique() {
        let dir = TempDir::new().unwrap();
        let channel = sqlite_channel(&dir).await;
        let store = Arc::new(SqliteWarehouse::open(dir.path().join("analytics.db"), 2).unwrap());
        let producer = Producer::new(channel, store, config());

        let a = producer.submit(click()).await.unwrap();
        let b = producer.submit(click()).await.unwrap();
        assert_ne!(a.event_id, b.event_id);
        assert_ne!(a.delivery_id, b.delivery_id);
    }
}
