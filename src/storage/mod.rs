//! SQLite storage layer -- schema, history store, rollups, retention.

pub mod history;
pub mod retention;
pub mod rollup;
pub mod schema;

pub use self::history::{
    AppendOutcome, AppendResult, AppendedEntry, HistoryEntry, HistoryStore, HistoryWindow, RunSummary,
    RunTest,
};
pub use self::retention::{PruneReport, RetentionPolicy};
pub use self::rollup::{DayRange, DurationRow, RollupTotals};

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Faults raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 10000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A row count for `LIMIT` or `ROW_NUMBER` comparisons. Saturates instead of
/// wrapping to a negative (unbounded) limit.
pub fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Canonical timestamp encoding. Fixed precision keeps lexical and
/// chronological order identical.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

/// UTC day bucket used by the rollup tables.
pub fn day_bucket(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_round_trip_and_order() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert_eq!(decode_ts(&encode_ts(&a)).unwrap(), a);
        assert!(encode_ts(&a) < encode_ts(&b));
        assert_eq!(day_bucket(&a), "2026-01-02");
    }

    #[test]
    fn test_open_pool_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fw.db");
        let pool = open_pool(&path).unwrap();
        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(path.exists());
    }

    #[test]
    fn test_sql_limit_saturates() {
        assert_eq!(sql_limit(20), 20);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
