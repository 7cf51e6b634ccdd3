//! Notification bus for subscription wake-up.
//!
//! - tokio::sync::broadcast for pub-sub notifications
//! - Lightweight notifications trigger targeted claims

use tokio::sync::broadcast::{self, error::RecvError, Receiver, Sender};

/// Notification sent when new messages are committed for a topic.
#[derive(Debug, Clone, Copy)]
pub struct NewDataNotification {
    /// The topic that has new data
    pub topic_id: i64,
    /// The maximum sequence number available
    pub max_seq: i64,
}

/// Notification bus for waking idle subscriptions.
///
/// Subscriptions listen for notifications and wake when new data is
/// available for their topic. Notifications only reach subscriptions in the
/// same process; delivery pumps also poll for cross-process publishes.
#[derive(Clone)]
pub struct NotificationBus {
    sender: Sender<NewDataNotification>,
}

impl NotificationBus {
    /// Create a new notification bus with the given capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of buffered notifications.
    ///   Older notifications are dropped if listeners fall behind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Listen for notifications about a single topic.
    pub fn listen(&self, topic_id: i64) -> TopicListener {
        TopicListener {
            topic_id,
            receiver: Some(self.sender.subscribe()),
        }
    }

    /// Notify listeners that new data is available.
    ///
    /// This is called by the writer thread after committing a batch.
    ///
    /// # Returns
    ///
    /// The number of receivers that received the notification.
    pub fn notify(&self, topic_id: i64, max_seq: i64) -> usize {
        // send() returns an error if there are no receivers, which is fine
        self.sender
            .send(NewDataNotification { topic_id, max_seq })
            .unwrap_or(0)
    }

    /// Get the number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiver filtered to one topic.
pub struct TopicListener {
    topic_id: i64,
    receiver: Option<Receiver<NewDataNotification>>,
}

impl TopicListener {
    /// Wait for the next notification for this topic.
    ///
    /// A lagging listener wakes immediately, since it may have missed a
    /// notification for its topic. Once the bus is gone this never resolves.
    pub async fn changed(&mut self) {
        loop {
            let Some(receiver) = self.receiver.as_mut() else {
                return std::future::pending().await;
            };
            let received = receiver.recv().await;
            match received {
                Ok(n) if n.topic_id == self.topic_id => return,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => return,
                Err(RecvError::Closed) => self.receiver = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notification_bus() {
        let bus = NotificationBus::new(16);
        let mut l1 = bus.listen(1);
        let mut l2 = bus.listen(1);

        let count = bus.notify(1, 42);
        assert_eq!(count, 2);

        tokio::time::timeout(Duration::from_secs(1), l1.changed())
            .await
            .expect("listener 1 should wake");
        tokio::time::timeout(Duration::from_secs(1), l2.changed())
            .await
            .expect("listener 2 should wake");
    }

    #[tokio::test]
    async fn test_listener_ignores_other_topics() {
        let bus = NotificationBus::new(16);
        let mut listener = bus.listen(1);

        bus.notify(2, 7);
        let woke = tokio::time::timeout(Duration::from_millis(50), listener.changed()).await;
        assert!(woke.is_err(), "notification for topic 2 should not wake topic 1");
    }

    #[test]
    fn test_notification_without_receivers() {
        let bus = NotificationBus::new(16);

        // No receivers - should not panic
        let count = bus.notify(1, 42);
        assert_eq!(count, 0);
    }
}
