//! Group commit for channel publishes.
//!
//! The writer thread parks publishes here until the batch is full or its
//! first publish reaches the commit deadline. The whole batch is written in
//! one transaction and every publisher is answered from that commit, so the
//! fsync of `synchronous=FULL` is paid once per batch rather than per event.

use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::writer::{PublishResult, WriterError};

/// Group commit limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Publishes that force a commit.
    pub max_batch_size: usize,
    /// Longest a publish waits for others to share its commit.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(5),
        }
    }
}

impl BatchConfig {
    pub fn from_config(batch_size: usize, batch_delay_ms: u64) -> Self {
        Self {
            max_batch_size: batch_size.max(1),
            max_batch_delay: Duration::from_millis(batch_delay_ms),
        }
    }
}

/// A publish waiting for its commit.
pub(super) struct PendingPublish {
    pub topic: String,
    pub message_id: String,
    pub payload: Option<Vec<u8>>,
    pub attributes: Option<String>,
    pub reply: oneshot::Sender<Result<PublishResult, WriterError>>,
}

/// Publishes accepted since the last commit.
pub(super) struct PublishBatch {
    config: BatchConfig,
    pending: Vec<PendingPublish>,
    commit_by: Option<Instant>,
}

impl PublishBatch {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            commit_by: None,
        }
    }

    /// Park a publish. Returns true when the batch must commit now.
    pub fn push(&mut self, publish: PendingPublish) -> bool {
        let delay = self.config.max_batch_delay;
        let commit_by = *self.commit_by.get_or_insert_with(|| Instant::now() + delay);
        self.pending.push(publish);
        self.pending.len() >= self.config.max_batch_size || Instant::now() >= commit_by
    }

    /// Time left before the batch is due. `None` while nothing is parked.
    pub fn time_left(&self) -> Option<Duration> {
        self.commit_by
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take the parked publishes for committing.
    pub fn take(&mut self) -> Vec<PendingPublish> {
        self.commit_by = None;
        std::mem::take(&mut self.pending)
    }
}

/// Answer each publisher of a committed batch with its sequence.
pub(super) fn confirm(committed: Vec<PendingPublish>, sequences: Vec<i64>, timestamp: i64) {
    for (publish, sequence) in committed.into_iter().zip(sequences) {
        let _ = publish.reply.send(Ok(PublishResult {
            message_id: publish.message_id,
            sequence,
            timestamp,
        }));
    }
}

/// Fail every publisher of a batch whose transaction did not commit.
pub(super) fn reject(failed: Vec<PendingPublish>, error: &WriterError) {
    for publish in failed {
        let _ = publish.reply.send(Err(error.clone()));
    }
}
