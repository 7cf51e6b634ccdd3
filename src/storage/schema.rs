//! Schema and queries for the embedded channel.
//!
//! Tables:
//! - `topics`: named topics, created on first publish
//! - `messages`: published payloads, `seq` is the global publish order
//! - `subscriptions`: named subscriptions bound to one topic
//! - `deliveries`: one row per (subscription, message) until acked
//!
//! A delivery is claimable when `visible_at <= now`. Claiming bumps
//! `attempts` and pushes `visible_at` out by the ack deadline (the lease);
//! nack moves `visible_at` to the redelivery time; ack deletes the row.
//! Resolutions carry the attempt number they were issued for, so a late
//! ack from an expired lease cannot resolve a newer delivery.

use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS topics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    topic_id     INTEGER NOT NULL REFERENCES topics(id),
    message_id   TEXT NOT NULL UNIQUE,
    payload      BLOB,
    attributes   TEXT,
    published_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    topic_id    INTEGER NOT NULL REFERENCES topics(id),
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS deliveries (
    subscription_id INTEGER NOT NULL REFERENCES subscriptions(id),
    seq             INTEGER NOT NULL REFERENCES messages(seq),
    attempts        INTEGER NOT NULL DEFAULT 0,
    visible_at      INTEGER NOT NULL,
    PRIMARY KEY (subscription_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_deliveries_visible
    ON deliveries (subscription_id, visible_at);
"#;

/// A subscription row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRow {
    pub id: i64,
    pub topic_id: i64,
}

/// A message leased to a subscriber by [`claim_deliveries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedMessage {
    pub seq: i64,
    /// Delivery attempt this lease belongs to (1 for the first delivery).
    pub attempt: u32,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub attributes: Option<String>,
    pub published_at: i64,
}

/// Apply pragmas for the writer connection.
///
/// WAL for concurrent readers, `synchronous=FULL` so a committed publish
/// survives power loss.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

/// Apply pragmas for pooled reader connections.
pub fn apply_reader_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))
}

/// Create tables and indexes if they do not exist.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Look up a topic by name, creating it if needed.
pub fn insert_or_get_topic(conn: &Connection, name: &str, now: i64) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO topics (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![name, now],
    )?;
    conn.query_row(
        "SELECT id FROM topics WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
}

/// Insert a message and fan it out to every subscription of its topic.
///
/// A message with no subscriptions is not retained. Returns the assigned
/// sequence number either way.
pub fn insert_message(
    conn: &Connection,
    topic_id: i64,
    message_id: &str,
    payload: Option<&[u8]>,
    attributes: Option<&str>,
    now: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO messages (topic_id, message_id, payload, attributes, published_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![topic_id, message_id, payload, attributes, now],
    )?;
    let seq = conn.last_insert_rowid();

    let fanned_out = conn.execute(
        "INSERT INTO deliveries (subscription_id, seq, attempts, visible_at)
         SELECT id, ?1, 0, ?2 FROM subscriptions WHERE topic_id = ?3",
        params![seq, now, topic_id],
    )?;
    // Nobody will ever ack it. AUTOINCREMENT keeps the sequence from being reused.
    if fanned_out == 0 {
        conn.execute("DELETE FROM messages WHERE seq = ?1", params![seq])?;
    }

    Ok(seq)
}

/// Create a subscription on a topic if it does not exist.
///
/// Returns the subscription as stored, which may be bound to a different
/// topic if it already existed.
pub fn create_subscription(
    conn: &Connection,
    topic_id: i64,
    name: &str,
    now: i64,
) -> rusqlite::Result<SubscriptionRow> {
    conn.execute(
        "INSERT INTO subscriptions (name, topic_id, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![name, topic_id, now],
    )?;
    find_subscription(conn, name)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

/// Find a subscription by name.
pub fn find_subscription(
    conn: &Connection,
    name: &str,
) -> rusqlite::Result<Option<SubscriptionRow>> {
    conn.query_row(
        "SELECT id, topic_id FROM subscriptions WHERE name = ?1",
        params![name],
        |row| {
            Ok(SubscriptionRow {
                id: row.get(0)?,
                topic_id: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Lease up to `limit` visible deliveries for a subscription.
///
/// Must run inside a transaction so the select and the lease update are atomic.
pub fn claim_deliveries(
    conn: &Connection,
    subscription_id: i64,
    now: i64,
    lease_until: i64,
    limit: u32,
) -> rusqlite::Result<Vec<ClaimedMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.seq, d.attempts, m.message_id, m.payload, m.attributes, m.published_at
         FROM deliveries d JOIN messages m ON m.seq = d.seq
         WHERE d.subscription_id = ?1 AND d.visible_at <= ?2
         ORDER BY d.visible_at ASC, d.seq ASC
         LIMIT ?3",
    )?;
    let claimed = stmt
        .query_map(params![subscription_id, now, limit], |row| {
            Ok(ClaimedMessage {
                seq: row.get(0)?,
                attempt: row.get::<_, u32>(1)? + 1,
                message_id: row.get(2)?,
                payload: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                attributes: row.get(4)?,
                published_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut lease = conn.prepare_cached(
        "UPDATE deliveries SET attempts = ?1, visible_at = ?2
         WHERE subscription_id = ?3 AND seq = ?4",
    )?;
    for message in &claimed {
        lease.execute(params![message.attempt, lease_until, subscription_id, message.seq])?;
    }

    Ok(claimed)
}

/// Acknowledge a delivery, removing it. Returns false for a stale attempt.
///
/// The message row is dropped once no subscription still holds it.
pub fn ack_delivery(
    conn: &Connection,
    subscription_id: i64,
    seq: i64,
    attempt: u32,
) -> rusqlite::Result<bool> {
    let removed = conn.execute(
        "DELETE FROM deliveries WHERE subscription_id = ?1 AND seq = ?2 AND attempts = ?3",
        params![subscription_id, seq, attempt],
    )?;
    if removed > 0 {
        conn.execute(
            "DELETE FROM messages WHERE seq = ?1
             AND NOT EXISTS (SELECT 1 FROM deliveries WHERE seq = ?1)",
            params![seq],
        )?;
    }
    Ok(removed > 0)
}

/// Negatively acknowledge a delivery, making it visible again at `visible_at`.
///
/// Returns false for a stale attempt.
pub fn nack_delivery(
    conn: &Connection,
    subscription_id: i64,
    seq: i64,
    attempt: u32,
    visible_at: i64,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE deliveries SET visible_at = ?1
         WHERE subscription_id = ?2 AND seq = ?3 AND attempts = ?4",
        params![visible_at, subscription_id, seq, attempt],
    )?;
    Ok(updated > 0)
}

/// Count deliveries not yet acknowledged (pending or leased).
pub fn backlog(conn: &Connection, subscription_id: i64) -> rusqlite::Result<u64> {
    conn.query_row(
        "SELECT COUNT(*) FROM deliveries WHERE subscription_id = ?1",
        params![subscription_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count.max(0) as u64)
}
