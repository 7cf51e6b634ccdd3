//! Consumer loop.
//!
//! Subscribes to the channel, hands deliveries to a fixed pool of workers
//! through a bounded queue, and keeps the metrics register's status and
//! readiness current.
//!
//! Shutdown:
//! - cancellation stops intake at once; queued but unstarted deliveries are
//!   abandoned and redeliver after their lease expires
//! - in-flight deliveries get a grace period, then are aborted
//! - a transport error on the delivery stream is fatal and returned

mod processor;

pub use processor::{EnvelopeProcessor, Outcome, ProcessingError};

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, DeliveryEnvelope, DurableChannel};
use crate::observability::{ConsumerStatus, MetricsRegister};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to subscribe to {subscription}: {source}")]
    Subscribe {
        subscription: String,
        #[source]
        source: ChannelError,
    },

    #[error("delivery stream failed: {0}")]
    Transport(#[source] ChannelError),
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub subscription: String,
    /// Worker count, also the subscription's outstanding-delivery limit.
    pub concurrency: u32,
    /// How long in-flight deliveries may run after shutdown begins.
    pub grace_period: Duration,
}

pub struct ConsumerLoop {
    channel: Arc<dyn DurableChannel>,
    processor: Arc<EnvelopeProcessor>,
    register: Arc<MetricsRegister>,
    config: ConsumerConfig,
}

type Queue = Arc<Mutex<mpsc::Receiver<DeliveryEnvelope>>>;

impl ConsumerLoop {
    pub fn new(
        channel: Arc<dyn DurableChannel>,
        processor: EnvelopeProcessor,
        register: Arc<MetricsRegister>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            channel,
            processor: Arc::new(processor),
            register,
            config,
        }
    }

    /// Run until `cancel` fires or the delivery stream fails.
    ///
    /// Returns `Ok` after a cancellation-driven stop (`status = stopped`) and
    /// `Err` when subscribing or the stream fails (`status = error`).
    #[tracing::instrument(skip_all, fields(subscription = %self.config.subscription))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let concurrency = self.config.concurrency.max(1);

        let mut deliveries = match self
            .channel
            .subscribe(&self.config.subscription, concurrency)
            .await
        {
            Ok(subscription) => subscription,
            Err(source) => {
                self.register.set_status(ConsumerStatus::Error);
                tracing::error!(error = %source, "Subscribe failed");
                return Err(ConsumerError::Subscribe {
                    subscription: self.config.subscription.clone(),
                    source,
                });
            }
        };
        self.register.mark_ready();
        tracing::info!(concurrency, "Consumer subscribed");

        let (queue_tx, queue_rx) = mpsc::channel(concurrency as usize);
        let queue: Queue = Arc::new(Mutex::new(queue_rx));
        let intake = cancel.child_token();

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            workers.spawn(worker(
                worker_id,
                Arc::clone(&queue),
                Arc::clone(&self.processor),
                intake.clone(),
            ));
        }

        // Workers own the queue; once they exit, a blocked send fails.
        drop(queue);

        let failure = loop {
            let item = tokio::select! {
                biased;
                () = intake.cancelled() => break None,
                item = deliveries.next() => item,
            };
            let envelope = match item {
                Some(Ok(envelope)) => envelope,
                Some(Err(e)) => break Some(e),
                None => break Some(ChannelError::Closed),
            };
            // A full queue must not hold off cancellation.
            tokio::select! {
                biased;
                () = intake.cancelled() => break None,
                sent = queue_tx.send(envelope) => {
                    if sent.is_err() {
                        break None;
                    }
                }
            }
        };

        intake.cancel();
        drop(deliveries);
        drop(queue_tx);

        self.drain(&mut workers).await;

        match failure {
            None => {
                self.register.set_status(ConsumerStatus::Stopped);
                tracing::info!("Consumer stopped");
                Ok(())
            }
            Some(e) => {
                self.register.set_status(ConsumerStatus::Error);
                tracing::error!(error = %e, "Consumer stopped on transport error");
                Err(ConsumerError::Transport(e))
            }
        }
    }

    /// Wait for in-flight deliveries, aborting whatever outlives the grace period.
    async fn drain(&self, workers: &mut JoinSet<()>) {
        let grace = self.config.grace_period;
        let finished = tokio::time::timeout(grace, join_all(workers)).await;
        if finished.is_err() {
            tracing::warn!(
                in_flight = workers.len(),
                grace_ms = grace.as_millis() as u64,
                "Grace period expired, abandoning in-flight deliveries"
            );
            workers.abort_all();
            join_all(workers).await;
        }
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(error = %e, "Worker panicked");
            }
        }
    }
}

async fn worker(
    worker_id: u32,
    queue: Queue,
    processor: Arc<EnvelopeProcessor>,
    intake: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = intake.cancelled() => None,
            envelope = async { queue.lock().await.recv().await } => envelope,
        };
        let Some(envelope) = next else {
            break;
        };
        processor.handle(envelope).await;
    }
    tracing::trace!(worker_id, "Worker exited");
}
