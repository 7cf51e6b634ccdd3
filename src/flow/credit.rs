//! Credit-based prefetch control for subscriptions.
//!
//! A subscription holds one credit per envelope it may have outstanding.
//! Credits are consumed when envelopes are handed out and returned when an
//! envelope is dropped, which caps the number of concurrent processing
//! attempts at the subscription's concurrency limit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Credit balance for a subscription.
///
/// Uses atomic operations for lock-free credit accounting, plus a
/// [`Notify`] so an idle delivery pump can sleep until credits come back.
#[derive(Debug, Default)]
pub struct CreditBalance {
    credits: AtomicU32,
    returned: Notify,
}

impl CreditBalance {
    /// Create a new credit balance starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new credit balance with initial credits.
    pub fn with_initial(initial: u32) -> Self {
        Self {
            credits: AtomicU32::new(initial),
            returned: Notify::new(),
        }
    }

    /// Add credits to the balance and wake a waiter.
    ///
    /// Returns the new total.
    pub fn add(&self, amount: u32) -> u32 {
        let total = self.credits.fetch_add(amount, Ordering::SeqCst) + amount;
        self.returned.notify_one();
        total
    }

    /// Try to consume one credit.
    ///
    /// Returns true if a credit was consumed, false if no credits available.
    pub fn try_consume(&self) -> bool {
        self.try_consume_many(1) == 1
    }

    /// Try to consume multiple credits.
    ///
    /// Returns the number of credits actually consumed (may be less than requested).
    pub fn try_consume_many(&self, amount: u32) -> u32 {
        loop {
            let current = self.credits.load(Ordering::SeqCst);
            if current == 0 || amount == 0 {
                return 0;
            }
            let to_consume = current.min(amount);
            if self
                .credits
                .compare_exchange(
                    current,
                    current - to_consume,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return to_consume;
            }
            // CAS failed, retry
        }
    }

    /// Get the current credit count.
    pub fn available(&self) -> u32 {
        self.credits.load(Ordering::SeqCst)
    }

    /// Wait until credits are returned.
    ///
    /// Returns immediately if a return happened since the last wait.
    pub async fn returned(&self) {
        self.returned.notified().await;
    }
}

/// A single consumed credit, returned to its balance on drop.
#[derive(Debug)]
pub struct CreditGuard {
    balance: Arc<CreditBalance>,
}

impl CreditGuard {
    /// Take ownership of one already-consumed credit.
    pub fn new(balance: Arc<CreditBalance>) -> Self {
        Self { balance }
    }
}

impl Drop for CreditGuard {
    fn drop(&mut self) {
        self.balance.add(1);
    }
}
