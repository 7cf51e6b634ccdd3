//! Tributary: event ingestion with an at-least-once durable channel.
//!
//! Events submitted to the [`producer`] are published onto a durable
//! [`channel`] and mirrored, best effort, into an [`analytics`] store. The
//! [`consumer`] loop pulls deliveries from the channel, writes each payload to
//! a [`sink`] under an idempotent key and acks or nacks it so the channel can
//! schedule redelivery.
//!
//! # Architecture
//!
//! - **At-Least-Once**: processing failures are nacked and redelivered by the
//!   channel; downstream writes are overwrite-safe
//! - **Embedded channel**: SQLite WAL persistence with group commit and
//!   lease-based redelivery
//! - **Bounded concurrency**: credit-limited prefetch feeding a fixed worker pool
//! - **Observable**: health/metrics HTTP server, OpenTelemetry metrics and tracing
//!
//! # Modules
//!
//! - [`analytics`]: Analytical store (best-effort secondary write)
//! - [`assistant`]: Text-generation collaborator behind `/chat`
//! - [`channel`]: Durable channel interface and SQLite implementation
//! - [`config`]: CLI and environment configuration
//! - [`consumer`]: Envelope processing and the consumer loop
//! - [`event`]: Event records and wire format
//! - [`flow`]: Credit tracking and notification bus
//! - [`http`]: Health server and ingest API routers
//! - [`observability`]: Metrics register, OpenTelemetry metrics, tracing setup
//! - [`producer`]: Event submission
//! - [`server`]: Process lifecycle for each subcommand
//! - [`sink`]: Blob sink interface and filesystem implementation
//! - [`storage`]: SQLite persistence layer for the channel

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // channel::ChannelError is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // seq/seq_no/sequence are fine
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod analytics;
pub mod assistant;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod event;
pub mod flow;
pub mod http;
pub mod observability;
pub mod producer;
pub mod server;
pub mod sink;
pub mod storage;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) channel message ID.
///
/// Message IDs double as delivery IDs: they are stable across redeliveries
/// of the same message.
#[must_use]
pub fn generate_message_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generate a new random (UUIDv4) event ID.
///
/// # Example
///
/// ```
/// let id = tributary::generate_event_id();
/// assert_eq!(id.len(), 36);
/// assert_ne!(id, tributary::generate_event_id());
/// ```
#[must_use]
pub fn generate_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
