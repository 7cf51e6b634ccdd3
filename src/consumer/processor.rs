//! Per-delivery processing.
//!
//! Each envelope moves `received -> processing -> {acked | nacked}`. Any
//! failure, including a panic inside processing, is counted and nacked so the
//! channel redelivers; nothing is retried locally.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::channel::DeliveryEnvelope;
use crate::event::EventRecord;
use crate::now_millis;
use crate::observability::metrics::{record_processed, record_processing_error};
use crate::observability::MetricsRegister;
use crate::sink::{processed_key, BlobSink, SinkError};

/// Why processing a delivery failed.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("payload is not an event record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("blob write failed: {0}")]
    Sink(#[from] SinkError),

    #[error("processing panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    /// Short category used as a metric attribute.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Sink(_) => "sink",
            Self::Panicked(_) => "panic",
        }
    }
}

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Nacked,
}

/// Writes each delivery's payload to the blob sink and resolves it.
pub struct EnvelopeProcessor {
    sink: Arc<dyn BlobSink>,
    register: Arc<MetricsRegister>,
    subscription: String,
}

impl EnvelopeProcessor {
    pub fn new(
        sink: Arc<dyn BlobSink>,
        register: Arc<MetricsRegister>,
        subscription: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            register,
            subscription: subscription.into(),
        }
    }

    /// Process one delivery and ack or nack it.
    #[tracing::instrument(
        skip(self, envelope),
        fields(delivery_id = %envelope.delivery_id(), attempt = envelope.attempt())
    )]
    pub async fn handle(&self, envelope: DeliveryEnvelope) -> Outcome {
        let start = Instant::now();
        let result = match AssertUnwindSafe(self.process(&envelope)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ProcessingError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(()) => {
                self.register.record_processed(now_millis());
                record_processed(&self.subscription, start.elapsed().as_secs_f64());
                if let Err(e) = envelope.ack().await {
                    // Counted as processed; the channel redelivers and the
                    // overwrite makes the retry harmless.
                    tracing::warn!(error = %e, "Ack failed");
                }
                tracing::debug!("Delivery processed");
                Outcome::Acked
            }
            Err(e) => {
                self.register.record_error();
                record_processing_error(&self.subscription, e.reason());
                tracing::error!(error = %e, "Delivery processing failed");
                if let Err(nack_error) = envelope.nack().await {
                    tracing::warn!(error = %nack_error, "Nack failed; lease expiry will redeliver");
                }
                Outcome::Nacked
            }
        }
    }

    async fn process(&self, envelope: &DeliveryEnvelope) -> Result<(), ProcessingError> {
        let record = EventRecord::from_wire(envelope.data())?;
        tracing::trace!(
            event_id = %record.event_id,
            event_type = %record.event_type,
            "Decoded event"
        );

        self.sink
            .put(&processed_key(envelope.delivery_id()), envelope.data())
            .await?;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
