//! Operator-managed quarantine flags.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::storage::{decode_ts, encode_ts, Pool, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantineEntry {
    pub identity_id: String,
    pub title: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Returns `false` when the test is unknown.
pub fn add(pool: &Pool, identity_id: &str, reason: &str) -> Result<bool, StoreError> {
    let conn = pool.get()?;
    let known: Option<String> = conn
        .query_row(
            "SELECT id FROM identities WHERE id = ?1",
            params![identity_id],
            |row| row.get(0),
        )
        .optional()?;
    if known.is_none() {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO quarantine (identity_id, reason, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(identity_id) DO UPDATE SET reason = excluded.reason",
        params![identity_id, reason, encode_ts(&Utc::now())],
    )?;
    Ok(true)
}

/// Returns `true` if a flag was removed.
pub fn remove(pool: &Pool, identity_id: &str) -> Result<bool, StoreError> {
    let conn = pool.get()?;
    let n = conn.execute("DELETE FROM quarantine WHERE identity_id = ?1", params![identity_id])?;
    Ok(n > 0)
}

pub fn list(pool: &Pool) -> Result<Vec<QuarantineEntry>, StoreError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT q.identity_id, i.title, q.reason, q.created_at
         FROM quarantine q JOIN identities i ON i.id = q.identity_id
         ORDER BY q.created_at, q.identity_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut entries = Vec::new();
    for r in rows {
        let (identity_id, title, reason, created_at) = r?;
        entries.push(QuarantineEntry {
            identity_id,
            title,
            reason,
            created_at: decode_ts(&created_at)?,
        });
    }
    Ok(entries)
}

pub fn contains(pool: &Pool, identity_id: &str) -> Result<bool, StoreError> {
    let conn = pool.get()?;
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM quarantine WHERE identity_id = ?1",
        params![identity_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}
