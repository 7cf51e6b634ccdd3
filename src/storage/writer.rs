//! Dedicated writer thread for the channel database.
//!
//! All mutations go through one SQLite connection owned by an OS thread.
//! Async callers talk to it over a bounded tokio channel (which also provides
//! backpressure) and receive results on oneshot replies.
//!
//! Publishes are group-committed: consecutive publishes are accumulated and
//! written in a single transaction. Any other command flushes the pending
//! batch first, so a claim never misses an already-acknowledged publish.

use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use super::batch::{self, BatchConfig, PendingPublish, PublishBatch};
use super::schema::{self, ClaimedMessage, SubscriptionRow};
use crate::flow::notify::NotificationBus;
use crate::now_millis;

/// Error type for writer operations.
#[derive(Debug, Clone, Error)]
pub enum WriterError {
    #[error("writer channel closed")]
    ChannelClosed,

    #[error("database error: {0}")]
    Database(String),

    #[error("writer thread panicked")]
    ThreadPanic,
}

impl From<rusqlite::Error> for WriterError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result of a committed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub message_id: String,
    pub sequence: i64,
    pub timestamp: i64,
}

/// How a leased delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Ack,
    /// Make the delivery visible again after the given delay.
    Nack { redeliver_after: Duration },
}

type Reply<T> = oneshot::Sender<Result<T, WriterError>>;

enum WriteCommand {
    Publish(PendingPublish),
    CreateSubscription {
        topic: String,
        subscription: String,
        reply: Reply<SubscriptionRow>,
    },
    Claim {
        subscription_id: i64,
        max: u32,
        lease: Duration,
        reply: Reply<Vec<ClaimedMessage>>,
    },
    Resolve {
        subscription_id: i64,
        seq: i64,
        attempt: u32,
        resolution: Resolution,
        reply: Reply<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable async handle to the writer thread.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteCommand>,
}

impl WriterHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> WriteCommand,
    ) -> Result<T, WriterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| WriterError::ChannelClosed)?;
        rx.await.map_err(|_| WriterError::ChannelClosed)?
    }

    /// Durably append a message to a topic, creating the topic if needed.
    ///
    /// Resolves once the batch containing the message has committed.
    pub async fn publish(
        &self,
        topic: String,
        message_id: String,
        payload: Option<Vec<u8>>,
        attributes: Option<String>,
    ) -> Result<PublishResult, WriterError> {
        self.request(|reply| {
            WriteCommand::Publish(PendingPublish {
                topic,
                message_id,
                payload,
                attributes,
                reply,
            })
        })
        .await
    }

    /// Create a subscription bound to a topic (idempotent).
    pub async fn create_subscription(
        &self,
        topic: String,
        subscription: String,
    ) -> Result<SubscriptionRow, WriterError> {
        self.request(|reply| WriteCommand::CreateSubscription {
            topic,
            subscription,
            reply,
        })
        .await
    }

    /// Lease up to `max` visible deliveries for `lease`.
    pub async fn claim(
        &self,
        subscription_id: i64,
        max: u32,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage>, WriterError> {
        self.request(|reply| WriteCommand::Claim {
            subscription_id,
            max,
            lease,
            reply,
        })
        .await
    }

    /// Resolve a leased delivery. Returns false if the lease was stale.
    pub async fn resolve(
        &self,
        subscription_id: i64,
        seq: i64,
        attempt: u32,
        resolution: Resolution,
    ) -> Result<bool, WriterError> {
        self.request(|reply| WriteCommand::Resolve {
            subscription_id,
            seq,
            attempt,
            resolution,
            reply,
        })
        .await
    }

    /// Flush pending writes and stop the writer thread.
    pub async fn shutdown(&self) -> Result<(), WriterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Shutdown { reply })
            .await
            .map_err(|_| WriterError::ChannelClosed)?;
        rx.await.map_err(|_| WriterError::ChannelClosed)
    }
}

/// Owner of the writer thread.
pub struct Writer {
    handle: WriterHandle,
    thread: JoinHandle<()>,
}

impl Writer {
    /// Open the database, initialize the schema and spawn the writer thread.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file
    /// * `notify_bus` - Bus notified after each committed publish batch
    /// * `channel_size` - Capacity of the command channel (backpressure)
    /// * `batch_config` - Group commit limits
    pub fn spawn<P: AsRef<Path>>(
        db_path: P,
        notify_bus: NotificationBus,
        channel_size: usize,
        batch_config: BatchConfig,
    ) -> Result<Self, WriterError> {
        let conn = Connection::open(db_path)?;
        schema::apply_pragmas(&conn)?;
        schema::initialize_schema(&conn)?;

        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let thread = std::thread::Builder::new()
            .name("tributary-writer".into())
            .spawn(move || WriterLoop::new(conn, notify_bus, batch_config).run(rx))
            .map_err(|e| WriterError::Database(format!("failed to spawn writer thread: {e}")))?;

        Ok(Self {
            handle: WriterHandle { tx },
            thread,
        })
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Wait for the writer thread to exit.
    pub fn join(self) -> Result<(), WriterError> {
        self.thread.join().map_err(|_| WriterError::ThreadPanic)
    }
}

struct WriterLoop {
    conn: Connection,
    notify_bus: NotificationBus,
    batch: PublishBatch,
}

impl WriterLoop {
    fn new(conn: Connection, notify_bus: NotificationBus, batch_config: BatchConfig) -> Self {
        Self {
            conn,
            notify_bus,
            batch: PublishBatch::new(batch_config),
        }
    }

    fn run(mut self, mut rx: mpsc::Receiver<WriteCommand>) {
        tracing::debug!("Writer thread started");

        while let Some(first) = rx.blocking_recv() {
            let mut next = Some(first);
            loop {
                if let Some(command) = next.take() {
                    if let ControlFlow::Stop = self.handle(command) {
                        tracing::debug!("Writer thread stopped");
                        return;
                    }
                }
                if self.batch.is_empty() {
                    break;
                }
                match rx.try_recv() {
                    Ok(command) => next = Some(command),
                    Err(TryRecvError::Empty) => match self.batch.time_left() {
                        Some(wait) if !wait.is_zero() => {
                            std::thread::sleep(wait.min(Duration::from_millis(1)));
                        }
                        _ => self.flush(),
                    },
                    Err(TryRecvError::Disconnected) => {
                        self.flush();
                        break;
                    }
                }
            }
        }

        self.flush();
        tracing::debug!("Writer thread stopped (all handles dropped)");
    }

    fn handle(&mut self, command: WriteCommand) -> ControlFlow {
        match command {
            WriteCommand::Publish(publish) => {
                if self.batch.push(publish) {
                    self.flush();
                }
            }
            WriteCommand::CreateSubscription {
                topic,
                subscription,
                reply,
            } => {
                self.flush();
                let _ = reply.send(self.create_subscription(&topic, &subscription));
            }
            WriteCommand::Claim {
                subscription_id,
                max,
                lease,
                reply,
            } => {
                self.flush();
                let _ = reply.send(self.claim(subscription_id, max, lease));
            }
            WriteCommand::Resolve {
                subscription_id,
                seq,
                attempt,
                resolution,
                reply,
            } => {
                self.flush();
                let _ = reply.send(self.resolve(subscription_id, seq, attempt, resolution));
            }
            WriteCommand::Shutdown { reply } => {
                self.flush();
                let _ = reply.send(());
                return ControlFlow::Stop;
            }
        }
        ControlFlow::Continue
    }

    /// Commit all pending publishes in one transaction.
    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let pending = self.batch.take();
        let now = now_millis();

        match self.commit_publishes(&pending, now) {
            Ok((sequences, max_seq_by_topic)) => {
                tracing::trace!(batch_size = pending.len(), "Committed publish batch");
                batch::confirm(pending, sequences, now);
                for (topic_id, max_seq) in max_seq_by_topic {
                    self.notify_bus.notify(topic_id, max_seq);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, batch_size = pending.len(), "Publish batch failed");
                batch::reject(pending, &WriterError::from(e));
            }
        }
    }

    fn commit_publishes(
        &mut self,
        pending: &[PendingPublish],
        now: i64,
    ) -> rusqlite::Result<(Vec<i64>, HashMap<i64, i64>)> {
        let tx = self.conn.transaction()?;
        let mut topic_ids: HashMap<&str, i64> = HashMap::new();
        let mut max_seq_by_topic = HashMap::new();
        let mut sequences = Vec::with_capacity(pending.len());

        for publish in pending {
            let topic_id = match topic_ids.get(publish.topic.as_str()) {
                Some(id) => *id,
                None => {
                    let id = schema::insert_or_get_topic(&tx, &publish.topic, now)?;
                    topic_ids.insert(&publish.topic, id);
                    id
                }
            };
            let seq = schema::insert_message(
                &tx,
                topic_id,
                &publish.message_id,
                publish.payload.as_deref(),
                publish.attributes.as_deref(),
                now,
            )?;
            max_seq_by_topic.insert(topic_id, seq);
            sequences.push(seq);
        }

        tx.commit()?;
        Ok((sequences, max_seq_by_topic))
    }

    fn create_subscription(
        &mut self,
        topic: &str,
        subscription: &str,
    ) -> Result<SubscriptionRow, WriterError> {
        let now = now_millis();
        let tx = self.conn.transaction()?;
        let topic_id = schema::insert_or_get_topic(&tx, topic, now)?;
        let row = schema::create_subscription(&tx, topic_id, subscription, now)?;
        tx.commit()?;
        Ok(row)
    }

    fn claim(
        &mut self,
        subscription_id: i64,
        max: u32,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage>, WriterError> {
        let now = now_millis();
        let lease_until = now.saturating_add(lease.as_millis() as i64);
        let tx = self.conn.transaction()?;
        let claimed = schema::claim_deliveries(&tx, subscription_id, now, lease_until, max)?;
        tx.commit()?;
        Ok(claimed)
    }

    fn resolve(
        &mut self,
        subscription_id: i64,
        seq: i64,
        attempt: u32,
        resolution: Resolution,
    ) -> Result<bool, WriterError> {
        let tx = self.conn.transaction()?;
        let applied = match resolution {
            Resolution::Ack => schema::ack_delivery(&tx, subscription_id, seq, attempt)?,
            Resolution::Nack { redeliver_after } => {
                let visible_at = now_millis().saturating_add(redeliver_after.as_millis() as i64);
                schema::nack_delivery(&tx, subscription_id, seq, attempt, visible_at)?
            }
        };
        tx.commit()?;
        Ok(applied)
    }
}

enum ControlFlow {
    Continue,
    Stop,
}
