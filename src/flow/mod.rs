//! Flow control and notification infrastructure.
//!
//! Provides:
//! - Credit-based prefetch limits for subscriptions
//! - Notification bus for waking idle subscriptions

pub mod credit;
pub mod notify;
