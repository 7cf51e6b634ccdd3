//! Analytical store for best-effort event rows.
//!
//! Rows are validated against the destination table's columns before they
//! are written. A row with any field error is rejected as a whole and the
//! errors are returned to the caller instead of failing the call; only
//! connection-level problems are reported as [`AnalyticsError`].

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::event::EventRecord;

/// Default table receiving event rows.
pub const EVENTS_TABLE: &str = "events";

const EVENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        TEXT NOT NULL PRIMARY KEY,
    event_type      TEXT NOT NULL,
    user_id         TEXT,
    event_timestamp INTEGER NOT NULL,
    event_data      TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (event_timestamp);
"#;

/// Connection-level analytical store failure.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("failed to get connection: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("analytical store unavailable: {0}")]
    Unavailable(String),
}

/// A field-level problem with one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub field: String,
    pub reason: String,
}

impl RowError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Summary of a stored event, newest first from [`AnalyticalStore::recent_events`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub event_id: String,
    pub event_type: String,
    pub user_id: Option<String>,
    pub timestamp: i64,
}

/// Row-oriented analytical warehouse.
#[async_trait]
pub trait AnalyticalStore: Send + Sync {
    /// Insert one row. Returns the row's field errors; an empty list means
    /// the row was stored.
    async fn insert_row(
        &self,
        table: &str,
        row: Map<String, Value>,
    ) -> Result<Vec<RowError>, AnalyticsError>;

    /// Most recent events by event timestamp.
    async fn recent_events(
        &self,
        table: &str,
        limit: usize,
    ) -> Result<Vec<EventSummary>, AnalyticsError>;
}

/// Build the analytics row for an event record.
pub fn event_row(record: &EventRecord) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("event_id".into(), Value::String(record.event_id.clone()));
    row.insert("event_type".into(), Value::String(record.event_type.clone()));
    row.insert(
        "user_id".into(),
        record.user_id.clone().map_or(Value::Null, Value::String),
    );
    row.insert("event_timestamp".into(), Value::from(record.created_at));
    row.insert("event_data".into(), Value::Object(record.payload.clone()));
    row
}

/// Warehouse in a local SQLite database (one file per dataset).
///
/// Rows keyed by an existing primary key are ignored, so retried inserts of
/// the same event do not duplicate it.
#[derive(Clone)]
pub struct SqliteWarehouse {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteWarehouse {
    /// Open the warehouse at `db_path`, creating the events table if needed.
    pub fn open<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self, AnalyticsError> {
        let manager = SqliteConnectionManager::file(db_path.as_ref())
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        {
            let conn = pool.get()?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.execute_batch(EVENTS_SCHEMA)?;
        }

        tracing::info!(path = %db_path.as_ref().display(), "Opened analytical store");
        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, AnalyticsError>
    where
        F: FnOnce(&Connection) -> Result<T, AnalyticsError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| AnalyticsError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl AnalyticalStore for SqliteWarehouse {
    #[tracing::instrument(skip(self, row))]
    async fn insert_row(
        &self,
        table: &str,
        row: Map<String, Value>,
    ) -> Result<Vec<RowError>, AnalyticsError> {
        let table = checked_table(table)?;
        self.with_conn(move |conn| {
            let columns = table_columns(conn, &table)?;
            let (names, values) = match bind_row(&columns, &row) {
                Ok(bound) => bound,
                Err(errors) => return Ok(errors),
            };

            let placeholders = vec!["?"; names.len()].join(", ");
            let sql = format!(
                "INSERT INTO \"{table}\" ({}) VALUES ({placeholders}) ON CONFLICT DO NOTHING",
                names
                    .iter()
                    .map(|name| format!("\"{name}\""))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let inserted = conn.execute(&sql, params_from_iter(values))?;
            if inserted == 0 {
                tracing::debug!(table = %table, "Duplicate row ignored");
            }
            Ok(Vec::new())
        })
        .await
    }

    async fn recent_events(
        &self,
        table: &str,
        limit: usize,
    ) -> Result<Vec<EventSummary>, AnalyticsError> {
        let table = checked_table(table)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT event_id, event_type, user_id, event_timestamp FROM \"{table}\"
                 ORDER BY event_timestamp DESC, rowid DESC
                 LIMIT ?1"
            ))?;
            let events = stmt
                .query_map(params![limit], |row| {
                    Ok(EventSummary {
                        event_id: row.get(0)?,
                        event_type: row.get(1)?,
                        user_id: row.get(2)?,
                        timestamp: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
        .await
    }
}

#[derive(Debug)]
struct Column {
    name: String,
    kind: ColumnKind,
    required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Real,
    Text,
}

impl ColumnKind {
    /// SQLite type affinity rules, reduced to the kinds rows can carry.
    fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Text
        }
    }
}

/// Table names are quoted identifiers; keep them to a safe alphabet.
fn checked_table(table: &str) -> Result<String, AnalyticsError> {
    if table.is_empty()
        || !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AnalyticsError::UnknownTable(table.to_string()));
    }
    Ok(table.to_string())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<Column>, AnalyticsError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let columns = stmt
        .query_map([], |row| {
            let declared: String = row.get(2)?;
            let not_null: bool = row.get(3)?;
            let default: Option<SqlValue> = row.get(4)?;
            Ok(Column {
                name: row.get(1)?,
                kind: ColumnKind::from_declared(&declared),
                required: not_null && default.is_none(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if columns.is_empty() {
        return Err(AnalyticsError::UnknownTable(table.to_string()));
    }
    Ok(columns)
}

/// Match row fields to columns, collecting every field error.
fn bind_row(
    columns: &[Column],
    row: &Map<String, Value>,
) -> Result<(Vec<String>, Vec<SqlValue>), Vec<RowError>> {
    let mut errors = Vec::new();

    for field in row.keys() {
        if !columns.iter().any(|c| &c.name == field) {
            errors.push(RowError::new(field, "no such field"));
        }
    }

    let mut names = Vec::new();
    let mut values = Vec::new();
    for column in columns {
        match row.get(&column.name) {
            None | Some(Value::Null) if column.required => {
                errors.push(RowError::new(&column.name, "missing required field"));
            }
            None => {}
            Some(value) => match to_sql(column.kind, value) {
                Some(sql) => {
                    names.push(column.name.clone());
                    values.push(sql);
                }
                None => errors.push(RowError::new(
                    &column.name,
                    format!("cannot store {} in {:?} column", json_kind(value), column.kind),
                )),
            },
        }
    }

    if errors.is_empty() {
        Ok((names, values))
    } else {
        Err(errors)
    }
}

fn to_sql(kind: ColumnKind, value: &Value) -> Option<SqlValue> {
    match (kind, value) {
        (_, Value::Null) => Some(SqlValue::Null),
        (ColumnKind::Integer, Value::Number(n)) => n.as_i64().map(SqlValue::Integer),
        (ColumnKind::Integer, Value::Bool(b)) => Some(SqlValue::Integer(i64::from(*b))),
        (ColumnKind::Real, Value::Number(n)) => n.as_f64().map(SqlValue::Real),
        (ColumnKind::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        // Nested values land as JSON text
        (ColumnKind::Text, Value::Object(_) | Value::Array(_)) => {
            Some(SqlValue::Text(value.to_string()))
        }
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
