//! Metrics register shared by the consumer loop and the health server.
//!
//! The consumer is the only writer. All fields are atomics so the health
//! server can take a value snapshot without ever waiting on processing.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};

use crate::now_millis;

/// Lifecycle status of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerStatus {
    Running,
    Stopped,
    Error,
}

impl ConsumerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Stopped,
            2 => Self::Error,
            _ => Self::Running,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Stopped => 1,
            Self::Error => 2,
        }
    }
}

/// Point-in-time copy of the register, as served on `/metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_errors: u64,
    /// Unix millis of the most recent successful processing, if any.
    pub last_message_time: Option<i64>,
    /// Unix millis at which the register was created.
    pub start_time: i64,
    pub status: ConsumerStatus,
}

#[derive(Debug)]
pub struct MetricsRegister {
    total_processed: AtomicU64,
    total_errors: AtomicU64,
    /// 0 until the first message is processed.
    last_message_millis: AtomicI64,
    start_time: i64,
    status: AtomicU8,
    ready: AtomicBool,
}

impl MetricsRegister {
    pub fn new() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            last_message_millis: AtomicI64::new(0),
            start_time: now_millis(),
            status: AtomicU8::new(ConsumerStatus::Running.as_u8()),
            ready: AtomicBool::new(false),
        }
    }

    /// Count a successfully processed message at `at` (Unix millis).
    ///
    /// `last_message_time` never moves backwards, even when concurrent
    /// workers finish out of order.
    pub fn record_processed(&self, at: i64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.last_message_millis.fetch_max(at.max(1), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_status(&self, status: ConsumerStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Mark the consumer as subscribed.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last = self.last_message_millis.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            last_message_time: (last > 0).then_some(last),
            start_time: self.start_time,
            status: self.status(),
        }
    }
}

impl Default for MetricsRegister {
    fn default() -> Self {
        Self::new()
    }
}
