//! SQLite storage layer for the embedded channel.
//!
//! Provides:
//! - Schema initialization and delivery bookkeeping queries
//! - Dedicated writer thread with group commit
//! - Read connection pool for lookups and backlog queries
//! - Batch commit logic for high throughput

pub mod batch;
pub mod reader;
pub mod schema;
pub mod writer;
