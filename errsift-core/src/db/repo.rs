//! Offset store repository
//!
//! Every operation opens its own connection, runs its statements and closes
//! it again. Nothing is held across calls, so units running on different
//! worker threads never share a connection.

use crate::error::{Error, Result};
use crate::types::{ExecutionRecord, OffsetKey, OffsetRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durable (source, stream, file_key) -> offset mapping plus execution history.
#[derive(Debug, Clone)]
pub struct OffsetStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl OffsetStore {
    /// Point the store at `path`, creating the parent directory if needed.
    ///
    /// The database file itself is created lazily by the first connection.
    pub fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(Self { path, busy_timeout })
    }

    /// Database file backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        Ok(conn)
    }

    /// Create tables if absent and apply pending migrations
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;
        super::schema::run_migrations(&conn)?;
        Ok(())
    }

    // ============================================
    // Offsets
    // ============================================

    /// Stored offset for `key`, or 0 when nothing has been committed yet
    pub fn get(&self, key: &OffsetKey) -> Result<u64> {
        let conn = self.connect()?;
        let offset: Option<i64> = conn
            .query_row(
                r#"
                SELECT offset_val FROM log_offsets
                WHERE source_name = ?1 AND stream_name = ?2 AND file_key = ?3
                "#,
                params![key.source, key.stream, key.file_key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(offset.map_or(0, |v| v.max(0) as u64))
    }

    /// Replace the offset for `key` unconditionally (last write wins)
    pub fn upsert(&self, key: &OffsetKey, offset: u64) -> Result<()> {
        let offset = i64::try_from(offset)
            .map_err(|e| Error::Database(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))?;

        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO log_offsets (source_name, stream_name, file_key, offset_val, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(source_name, stream_name, file_key) DO UPDATE SET
                offset_val = excluded.offset_val,
                updated_at = excluded.updated_at
            "#,
            params![
                key.source,
                key.stream,
                key.file_key,
                offset,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All stored offsets, ordered by key
    pub fn list_offsets(&self) -> Result<Vec<OffsetRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT source_name, stream_name, file_key, offset_val, updated_at
            FROM log_offsets
            ORDER BY source_name, stream_name, file_key
            "#,
        )?;
        let records = stmt
            .query_map([], Self::row_to_offset)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Most recently committed file of a stream other than `current_file`.
    ///
    /// After a rotation this is the file that was newest before it.
    pub fn previous_file(
        &self,
        source: &str,
        stream: &str,
        current_file: &str,
    ) -> Result<Option<OffsetRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT source_name, stream_name, file_key, offset_val, updated_at
            FROM log_offsets
            WHERE source_name = ?1 AND stream_name = ?2 AND file_key != ?3
            "#,
        )?;
        let records = stmt
            .query_map(params![source, stream, current_file], Self::row_to_offset)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // RFC 3339 text with variable sub-second digits does not sort lexically
        Ok(records
            .into_iter()
            .max_by(|a, b| (a.updated_at, &a.key.file_key).cmp(&(b.updated_at, &b.key.file_key))))
    }

    fn row_to_offset(row: &Row) -> rusqlite::Result<OffsetRecord> {
        let offset: i64 = row.get("offset_val")?;
        let updated_at: Option<String> = row.get("updated_at")?;

        Ok(OffsetRecord {
            key: OffsetKey::new(
                row.get::<_, String>("source_name")?,
                row.get::<_, String>("stream_name")?,
                row.get::<_, String>("file_key")?,
            ),
            offset: offset.max(0) as u64,
            updated_at: updated_at.as_deref().and_then(parse_timestamp),
        })
    }

    // ============================================
    // Execution history
    // ============================================

    /// Append one cycle record; history is insert-only
    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO execution_log
                (run_id, run_time, duration_ms, status, payload_json, response_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.run_id,
                record.run_time.to_rfc3339(),
                record.duration_ms,
                record.status.as_str(),
                record.payload.to_string(),
                record.response.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent `limit` execution records, newest first
    pub fn recent_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, run_time, duration_ms, status, payload_json, response_json
            FROM execution_log
            ORDER BY run_time DESC, id DESC
            LIMIT ?1
            "#,
        )?;
        let records = stmt
            .query_map([limit as i64], Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn row_to_execution(row: &Row) -> rusqlite::Result<ExecutionRecord> {
        let run_time: String = row.get("run_time")?;
        let status: String = row.get("status")?;
        let payload: Option<String> = row.get("payload_json")?;
        let response: Option<String> = row.get("response_json")?;

        Ok(ExecutionRecord {
            run_id: row.get("run_id")?,
            run_time: parse_timestamp(&run_time).unwrap_or_else(Utc::now),
            duration_ms: row.get("duration_ms")?,
            status: status.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            payload: parse_json(payload),
            response: parse_json(response),
        })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_json(s: Option<String>) -> serde_json::Value {
    s.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}
