//! Read connection pool for channel lookups.
//!
//! Uses r2d2 with r2d2_sqlite for pooled read access.
//! SQLite WAL mode allows concurrent readers alongside the writer thread.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OpenFlags, OptionalExtension};
use std::path::Path;
use thiserror::Error;

use super::schema::{self, apply_reader_pragmas, SubscriptionRow};

/// Error type for reader pool operations.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Failed to create connection pool: {0}")]
    PoolCreation(#[from] r2d2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Read-only connection pool.
///
/// The database must already exist (the writer creates it).
#[derive(Clone)]
pub struct ReaderPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReaderPool {
    /// Create a new reader pool for the given database path.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file
    /// * `max_size` - Maximum number of connections in the pool
    pub fn new<P: AsRef<Path>>(db_path: P, max_size: u32) -> Result<Self, ReaderError> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);

        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .connection_customizer(Box::new(ReaderConnectionCustomizer))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>, ReaderError> {
        Ok(self.pool.get()?)
    }

    /// Look up a subscription by name.
    pub fn find_subscription(&self, name: &str) -> Result<Option<SubscriptionRow>, ReaderError> {
        let conn = self.get()?;
        Ok(schema::find_subscription(&conn, name)?)
    }

    /// Name of the topic a subscription is bound to.
    pub fn topic_name(&self, topic_id: i64) -> Result<Option<String>, ReaderError> {
        let conn = self.get()?;
        Ok(conn
            .query_row(
                "SELECT name FROM topics WHERE id = ?1",
                params![topic_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Count unacknowledged deliveries for a subscription.
    pub fn backlog(&self, subscription_id: i64) -> Result<u64, ReaderError> {
        let conn = self.get()?;
        Ok(schema::backlog(&conn, subscription_id)?)
    }
}

/// Connection customizer that applies reader pragmas.
#[derive(Debug)]
struct ReaderConnectionCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for ReaderConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        apply_reader_pragmas(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{
        apply_pragmas, create_subscription, initialize_schema, insert_message,
        insert_or_get_topic,
    };
    use rusqlite::Connection;
    use tempfile::TempDir;

    #[test]
    fn test_reader_sees_committed_state() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Create the database first with a write connection
        let sub = {
            let conn = Connection::open(&db_path).unwrap();
            apply_pragmas(&conn).unwrap();
            initialize_schema(&conn).unwrap();
            let topic = insert_or_get_topic(&conn, "events", 1_700_000_000_000).unwrap();
            let sub = create_subscription(&conn, topic, "workers", 0).unwrap();
            insert_message(&conn, topic, "m1", Some(b"x"), None, 0).unwrap();
            insert_message(&conn, topic, "m2", Some(b"y"), None, 0).unwrap();
            sub
        };

        let pool = ReaderPool::new(&db_path, 5).unwrap();

        assert_eq!(pool.find_subscription("workers").unwrap(), Some(sub));
        assert_eq!(pool.find_subscription("nobody").unwrap(), None);
        assert_eq!(pool.topic_name(sub.topic_id).unwrap().as_deref(), Some("events"));
        assert_eq!(pool.backlog(sub.id).unwrap(), 2);
    }
}
