//! Embedded durable channel backed by SQLite.
//!
//! - Publishes go through the dedicated writer thread (group commit, fsync)
//! - Each subscription runs a delivery pump that leases messages for the
//!   ack deadline, limited by the subscription's credits
//! - Idle pumps wake on the notification bus, on returned credits, or on the
//!   poll interval (cross-process publishes, expired leases, nack backoff)

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::{
    validate_name, AckHandle, ChannelError, DeliveryEnvelope, DurableChannel, PublishReceipt,
    RedeliveryPolicy, Subscription, MAX_PAYLOAD_SIZE,
};
use crate::flow::credit::{CreditBalance, CreditGuard};
use crate::flow::notify::{NotificationBus, TopicListener};
use crate::generate_message_id;
use crate::observability::metrics::{record_publish, record_redelivery};
use crate::storage::batch::BatchConfig;
use crate::storage::reader::{ReaderError, ReaderPool};
use crate::storage::schema::{ClaimedMessage, SubscriptionRow};
use crate::storage::writer::{Resolution, Writer, WriterError, WriterHandle};

impl From<WriterError> for ChannelError {
    fn from(e: WriterError) -> Self {
        match e {
            WriterError::ChannelClosed => Self::Closed,
            WriterError::Database(msg) => Self::Unavailable(format!("database error: {msg}")),
            WriterError::ThreadPanic => Self::Unavailable("writer thread panicked".into()),
        }
    }
}

impl From<ReaderError> for ChannelError {
    fn from(e: ReaderError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Tuning for the embedded channel.
#[derive(Debug, Clone)]
pub struct SqliteChannelConfig {
    /// How long a claimed delivery stays leased before it is redelivered.
    pub ack_deadline: Duration,
    /// Upper bound on how long an idle pump sleeps between claims.
    pub poll_interval: Duration,
    pub redelivery: RedeliveryPolicy,
    pub batch: BatchConfig,
    /// Size of the write channel (backpressure control)
    pub write_channel_size: usize,
    pub reader_pool_size: u32,
    pub notify_channel_size: usize,
}

impl Default for SqliteChannelConfig {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            redelivery: RedeliveryPolicy::default(),
            batch: BatchConfig::default(),
            write_channel_size: 1000,
            reader_pool_size: 4,
            notify_channel_size: 1024,
        }
    }
}

/// SQLite-backed [`DurableChannel`].
pub struct SqliteChannel {
    writer: WriterHandle,
    writer_thread: Mutex<Option<Writer>>,
    readers: ReaderPool,
    notify_bus: NotificationBus,
    config: SqliteChannelConfig,
}

impl SqliteChannel {
    /// Open (or create) the channel database at `db_path`.
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        config: SqliteChannelConfig,
    ) -> Result<Self, ChannelError> {
        let db_path = db_path.as_ref();
        let notify_bus = NotificationBus::new(config.notify_channel_size);

        let writer = Writer::spawn(
            db_path,
            notify_bus.clone(),
            config.write_channel_size,
            config.batch,
        )?;
        let readers = ReaderPool::new(db_path, config.reader_pool_size)?;

        tracing::info!(path = %db_path.display(), "Opened channel database");

        Ok(Self {
            writer: writer.handle(),
            writer_thread: Mutex::new(Some(writer)),
            readers,
            notify_bus,
            config,
        })
    }

    /// Create a subscription on `topic` if it does not exist yet.
    ///
    /// Only messages published after the subscription exists are delivered
    /// to it. Fails if the name is already bound to a different topic.
    pub async fn create_subscription(&self, topic: &str, name: &str) -> Result<(), ChannelError> {
        validate_name("topic", topic)?;
        validate_name("subscription", name)?;

        let row = self
            .writer
            .create_subscription(topic.to_string(), name.to_string())
            .await?;

        let readers = self.readers.clone();
        let bound = blocking(move || readers.topic_name(row.topic_id)).await?;
        match bound {
            Some(bound) if bound == topic => Ok(()),
            Some(bound) => Err(ChannelError::Rejected(format!(
                "subscription {name} is bound to topic {bound}"
            ))),
            None => Err(ChannelError::Unavailable(format!(
                "subscription {name} has no topic"
            ))),
        }
    }

    /// Deliveries of a subscription not yet acknowledged (pending or leased).
    pub async fn backlog(&self, name: &str) -> Result<u64, ChannelError> {
        let row = self.find_subscription(name).await?;
        let readers = self.readers.clone();
        blocking(move || readers.backlog(row.id)).await
    }

    /// Flush pending publishes and stop the writer thread.
    ///
    /// Open subscriptions end with [`ChannelError::Closed`]. Calling `close`
    /// twice is a no-op.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let writer = self
            .writer_thread
            .lock()
            .map_err(|_| ChannelError::Unavailable("writer lock poisoned".into()))?
            .take();
        let Some(writer) = writer else {
            return Ok(());
        };

        tracing::info!("Shutting down channel writer thread");
        self.writer.shutdown().await?;
        tokio::task::spawn_blocking(move || writer.join())
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))??;
        Ok(())
    }

    async fn find_subscription(&self, name: &str) -> Result<SubscriptionRow, ChannelError> {
        let readers = self.readers.clone();
        let lookup = name.to_string();
        blocking(move || readers.find_subscription(&lookup))
            .await?
            .ok_or_else(|| ChannelError::SubscriptionNotFound(name.to_string()))
    }
}

#[async_trait]
impl DurableChannel for SqliteChannel {
    #[tracing::instrument(skip(self, payload, attributes), fields(bytes = payload.len()))]
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<PublishReceipt, ChannelError> {
        let start = Instant::now();
        validate_name("topic", topic)?;

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ChannelError::Rejected(format!(
                "payload too large: {} bytes (max {} bytes)",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let attributes = if attributes.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&attributes)
                    .map_err(|e| ChannelError::Rejected(format!("invalid attributes: {e}")))?,
            )
        };

        let result = self
            .writer
            .publish(
                topic.to_string(),
                generate_message_id(),
                if payload.is_empty() { None } else { Some(payload) },
                attributes,
            )
            .await?;

        let latency = start.elapsed().as_secs_f64();
        record_publish(topic, latency);

        tracing::debug!(
            message_id = %result.message_id,
            sequence = result.sequence,
            latency_ms = latency * 1000.0,
            "Message published"
        );

        Ok(PublishReceipt {
            message_id: result.message_id,
            sequence: result.sequence,
            published_at: result.timestamp,
        })
    }

    async fn subscribe(
        &self,
        subscription: &str,
        concurrency_limit: u32,
    ) -> Result<Subscription, ChannelError> {
        validate_name("subscription", subscription)?;
        let row = self.find_subscription(subscription).await?;

        let limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(limit as usize);

        let pump = DeliveryPump {
            name: subscription.to_string(),
            subscription: row,
            writer: self.writer.clone(),
            credits: Arc::new(CreditBalance::with_initial(limit)),
            listener: self.notify_bus.listen(row.topic_id),
            tx,
            ack_deadline: self.config.ack_deadline,
            poll_interval: self.config.poll_interval,
            redelivery: self.config.redelivery,
        };
        tokio::spawn(pump.run());

        tracing::info!(subscription, concurrency_limit = limit, "Subscription opened");
        Ok(Subscription::from_receiver(subscription, rx))
    }
}

/// Run a reader pool query off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ChannelError>
where
    F: FnOnce() -> Result<T, ReaderError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChannelError::Unavailable(e.to_string()))?
        .map_err(ChannelError::from)
}

/// Feeds one subscription's delivery stream.
struct DeliveryPump {
    name: String,
    subscription: SubscriptionRow,
    writer: WriterHandle,
    credits: Arc<CreditBalance>,
    listener: TopicListener,
    tx: mpsc::Sender<Result<DeliveryEnvelope, ChannelError>>,
    ack_deadline: Duration,
    poll_interval: Duration,
    redelivery: RedeliveryPolicy,
}

impl DeliveryPump {
    async fn run(mut self) {
        loop {
            let wanted = self.credits.available();
            if wanted > 0 {
                let claimed = match self
                    .writer
                    .claim(self.subscription.id, wanted, self.ack_deadline)
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        tracing::warn!(
                            subscription = %self.name,
                            error = %e,
                            "Delivery pump stopped"
                        );
                        let _ = self.tx.send(Err(e.into())).await;
                        return;
                    }
                };

                let full = claimed.len() as u32 == wanted;
                if !self.deliver(claimed).await {
                    break;
                }
                if full {
                    // There may be more visible deliveries than credits had room for.
                    continue;
                }
            }

            tokio::select! {
                () = self.listener.changed() => {}
                () = self.credits.returned() => {}
                () = tokio::time::sleep(self.poll_interval) => {}
                () = self.tx.closed() => break,
            }
        }

        tracing::debug!(subscription = %self.name, "Delivery pump finished");
    }

    /// Hand claimed messages to the subscriber. Returns false once the
    /// subscriber is gone.
    async fn deliver(&self, claimed: Vec<ClaimedMessage>) -> bool {
        let granted = self.credits.try_consume_many(claimed.len() as u32) as usize;
        if granted < claimed.len() {
            // Unreachable while this pump is the only consumer of the balance;
            // the surplus leases simply expire and redeliver.
            tracing::warn!(
                subscription = %self.name,
                claimed = claimed.len(),
                granted,
                "Claimed more deliveries than credits"
            );
        }

        for message in claimed.into_iter().take(granted) {
            if message.attempt > 1 {
                record_redelivery(&self.name);
            }
            let envelope = self.envelope(message);
            if self.tx.send(Ok(envelope)).await.is_err() {
                return false;
            }
        }
        true
    }

    fn envelope(&self, message: ClaimedMessage) -> DeliveryEnvelope {
        let attributes = message
            .attributes
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<HashMap<String, String>>(raw).unwrap_or_else(|e| {
                    tracing::warn!(seq = message.seq, error = %e, "Dropping unreadable attributes");
                    HashMap::new()
                })
            })
            .unwrap_or_default();

        let handle = SqliteAckHandle {
            writer: self.writer.clone(),
            subscription_id: self.subscription.id,
            seq: message.seq,
            attempt: message.attempt,
            redelivery: self.redelivery,
            _credit: CreditGuard::new(Arc::clone(&self.credits)),
        };

        DeliveryEnvelope::new(
            message.message_id,
            message.attempt,
            message.payload,
            attributes,
            message.published_at,
            Box::new(handle),
        )
    }
}

/// Resolves one leased delivery. Holds the subscription credit until the
/// envelope is dropped.
struct SqliteAckHandle {
    writer: WriterHandle,
    subscription_id: i64,
    seq: i64,
    attempt: u32,
    redelivery: RedeliveryPolicy,
    _credit: CreditGuard,
}

#[async_trait]
impl AckHandle for SqliteAckHandle {
    async fn ack(&self) -> Result<(), ChannelError> {
        let applied = self
            .writer
            .resolve(self.subscription_id, self.seq, self.attempt, Resolution::Ack)
            .await?;
        if !applied {
            tracing::debug!(
                seq = self.seq,
                attempt = self.attempt,
                "Ack for expired lease ignored"
            );
        }
        Ok(())
    }

    async fn nack(&self) -> Result<(), ChannelError> {
        let redeliver_after = self.redelivery.backoff(self.attempt);
        let applied = self
            .writer
            .resolve(
                self.subscription_id,
                self.seq,
                self.attempt,
                Resolution::Nack { redeliver_after },
            )
            .await?;
        if !applied {
            tracing::debug!(
                seq = self.seq,
                attempt = self.attempt,
                "Nack for expired lease ignored"
            );
        }
        Ok(())
    }
}
