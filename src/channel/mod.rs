//! Durable channel interface.
//!
//! The pipeline only talks to its transport through [`DurableChannel`]:
//! publish bytes to a topic, subscribe to a stream of [`DeliveryEnvelope`]s,
//! and resolve each envelope with ack or nack. Delivery is at-least-once;
//! redelivery timing after a nack is the transport's [`RedeliveryPolicy`].

pub mod sqlite;

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub use sqlite::{SqliteChannel, SqliteChannelConfig};

/// Maximum payload size (4MB).
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Transport-level failures ("channel unavailable").
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("channel did not confirm within {0:?}")]
    Timeout(Duration),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("channel rejected request: {0}")]
    Rejected(String),

    #[error("channel closed")]
    Closed,
}

/// Confirmation that a publish is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Transport-assigned message id; becomes the delivery id.
    pub message_id: String,
    pub sequence: i64,
    /// Unix millis at which the channel committed the message.
    pub published_at: i64,
}

/// An at-least-once publish/subscribe transport.
#[async_trait]
pub trait DurableChannel: Send + Sync {
    /// Publish a payload and wait until the channel confirms durable receipt.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<PublishReceipt, ChannelError>;

    /// Open a delivery stream with at most `concurrency_limit` envelopes
    /// outstanding at once.
    async fn subscribe(
        &self,
        subscription: &str,
        concurrency_limit: u32,
    ) -> Result<Subscription, ChannelError>;
}

/// Transport side of an envelope's ack/nack.
///
/// [`DeliveryEnvelope`] guarantees each handle is resolved at most once.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), ChannelError>;
    async fn nack(&self) -> Result<(), ChannelError>;
}

/// How an envelope was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Unresolved,
    Acked,
    Nacked,
}

const UNRESOLVED: u8 = 0;
const ACKED: u8 = 1;
const NACKED: u8 = 2;

/// One delivery attempt of one message.
///
/// Must be acked or nacked; an envelope dropped unresolved is abandoned and
/// redelivered once its lease expires.
pub struct DeliveryEnvelope {
    delivery_id: String,
    attempt: u32,
    data: Vec<u8>,
    attributes: HashMap<String, String>,
    published_at: i64,
    state: AtomicU8,
    handle: Box<dyn AckHandle>,
}

impl DeliveryEnvelope {
    pub fn new(
        delivery_id: impl Into<String>,
        attempt: u32,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
        published_at: i64,
        handle: Box<dyn AckHandle>,
    ) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            attempt,
            data,
            attributes,
            published_at,
            state: AtomicU8::new(UNRESOLVED),
            handle,
        }
    }

    /// Transport identifier, stable across redeliveries of the same message.
    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    /// 1 for the first delivery, incremented on each redelivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn published_at(&self) -> i64 {
        self.published_at
    }

    pub fn state(&self) -> EnvelopeState {
        match self.state.load(Ordering::SeqCst) {
            ACKED => EnvelopeState::Acked,
            NACKED => EnvelopeState::Nacked,
            _ => EnvelopeState::Unresolved,
        }
    }

    /// Acknowledge the delivery.
    ///
    /// Returns `Ok(false)` without contacting the transport if the envelope
    /// was already resolved.
    pub async fn ack(&self) -> Result<bool, ChannelError> {
        if !self.resolve(ACKED) {
            return Ok(false);
        }
        self.handle.ack().await.map(|()| true)
    }

    /// Negatively acknowledge the delivery, asking for redelivery.
    ///
    /// Returns `Ok(false)` without contacting the transport if the envelope
    /// was already resolved.
    pub async fn nack(&self) -> Result<bool, ChannelError> {
        if !self.resolve(NACKED) {
            return Ok(false);
        }
        self.handle.nack().await.map(|()| true)
    }

    fn resolve(&self, to: u8) -> bool {
        self.state
            .compare_exchange(UNRESOLVED, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl std::fmt::Debug for DeliveryEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEnvelope")
            .field("delivery_id", &self.delivery_id)
            .field("attempt", &self.attempt)
            .field("bytes", &self.data.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one subscription.
///
/// An `Err` item is a transport failure; the stream ends after it.
pub struct Subscription {
    name: String,
    inner: ReceiverStream<Result<DeliveryEnvelope, ChannelError>>,
}

impl Subscription {
    /// Wrap a receiver fed by a transport's delivery pump.
    pub fn from_receiver(
        name: impl Into<String>,
        rx: mpsc::Receiver<Result<DeliveryEnvelope, ChannelError>>,
    ) -> Self {
        Self {
            name: name.into(),
            inner: ReceiverStream::new(rx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Stream for Subscription {
    type Item = Result<DeliveryEnvelope, ChannelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Transport redelivery policy after a nack: exponential backoff between
/// `min_backoff` and `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl RedeliveryPolicy {
    /// Delay before redelivering a message nacked on `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.min_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
            .max(self.min_backoff.min(self.max_backoff))
    }
}

/// Validate a topic or subscription name.
///
/// Alphanumerics, dashes, underscores and dots, 1 to 255 characters.
pub fn validate_name(kind: &str, name: &str) -> Result<(), ChannelError> {
    if name.is_empty() {
        return Err(ChannelError::Rejected(format!("{kind} cannot be empty")));
    }
    if name.len() > 255 {
        return Err(ChannelError::Rejected(format!(
            "{kind} name too long (max 255 characters)"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ChannelError::Rejected(format!(
            "{kind} name must contain only alphanumeric characters, dashes, underscores, or dots"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::{envelope, AckCounts};
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let counts = Arc::new(AckCounts::default());
        let env = envelope("d1", b"{}", &counts);
        assert_eq!(env.state(), EnvelopeState::Unresolved);

        assert!(env.ack().await.unwrap());
        assert!(!env.ack().await.unwrap());
        assert!(!env.nack().await.unwrap());

        assert_eq!(env.state(), EnvelopeState::Acked);
        assert_eq!(counts.acks(), 1);
        assert_eq!(counts.nacks(), 0);
    }

    #[tokio::test]
    async fn test_nack_then_ack_is_ignored() {
        let counts = Arc::new(AckCounts::default());
        let env = envelope("d1", b"{}", &counts);

        assert!(env.nack().await.unwrap());
        assert!(!env.ack().await.unwrap());

        assert_eq!(env.state(), EnvelopeState::Nacked);
        assert_eq!(counts.acks(), 0);
        assert_eq!(counts.nacks(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RedeliveryPolicy {
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_backoff_policy() {
        let policy = RedeliveryPolicy {
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        assert_eq!(policy.backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_validate_name() {
        for valid in ["simple", "with-dashes", "with_underscores", "with.dots", "Mixed-1.a_b"] {
            assert!(validate_name("topic", valid).is_ok(), "{valid} should be valid");
        }
        for invalid in ["", "topic/name", "topic:name", "topic name", "topic@name"] {
            assert!(validate_name("topic", invalid).is_err(), "{invalid:?} should be invalid");
        }
        assert!(validate_name("topic", &"a".repeat(256)).is_err());
    }
}
