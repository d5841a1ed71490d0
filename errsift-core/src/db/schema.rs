//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: offsets and execution history
    r#"
    CREATE TABLE IF NOT EXISTS log_offsets (
        source_name      TEXT NOT NULL,
        stream_name      TEXT NOT NULL,
        file_key         TEXT NOT NULL,
        offset_val       INTEGER NOT NULL CHECK (offset_val >= 0),
        updated_at       DATETIME NOT NULL,
        PRIMARY KEY (source_name, stream_name, file_key)
    );

    CREATE TABLE IF NOT EXISTS execution_log (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id           TEXT NOT NULL,
        run_time         DATETIME NOT NULL,
        duration_ms      INTEGER NOT NULL,
        status           TEXT NOT NULL,
        payload_json     JSON,
        response_json    JSON
    );

    CREATE INDEX IF NOT EXISTS idx_execution_log_run_time ON execution_log(run_time DESC);
    CREATE INDEX IF NOT EXISTS idx_execution_log_status ON execution_log(status) WHERE status != 'success';
    "#,
];

/// Apply every migration newer than the stored `user_version`.
///
/// Each migration and its version bump commit together. Returns the number
/// of migrations applied.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    let current = get_schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "offset store schema v{} is newer than this build (v{})",
            current, SCHEMA_VERSION
        )));
    }

    let mut applied = 0;
    for (version, migration) in (1..).zip(MIGRATIONS.iter()).skip(current as usize) {
        tracing::info!(version, "Applying offset store migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        applied += 1;
    }

    if applied > 0 {
        tracing::info!(from = current, to = SCHEMA_VERSION, "Offset store schema up to date");
    }
    Ok(applied)
}

/// Schema version recorded in the database (0 for a fresh file)
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        assert_eq!(run_migrations(&conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&conn).unwrap(), 0);

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["log_offsets", "execution_log"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(run_migrations(&conn).unwrap_err().is_fatal());
    }

    #[test]
    fn test_negative_offsets_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO log_offsets VALUES ('s', 't', 'f.log', -1, '2025-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
