use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::classify::Classification;
use crate::storage::{decode_ts, encode_ts, sql_limit, Pool, StoreError};

/// A change of a test's classification, caused by the history entry
/// `history_seq`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub id: Uuid,
    pub identity_id: String,
    pub title: String,
    pub from: Classification,
    pub to: Classification,
    pub flake_score: f64,
    pub history_seq: i64,
    pub at: DateTime<Utc>,
}

/// Durable log of classification transitions.
#[derive(Clone)]
pub struct TransitionLog {
    pool: Pool,
}

impl TransitionLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn record(&self, event: &TransitionEvent) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO transitions (id, identity_id, from_class, to_class, flake_score, history_seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id.to_string(),
                event.identity_id,
                event.from.as_str(),
                event.to.as_str(),
                event.flake_score,
                event.history_seq,
                encode_ts(&event.at),
            ],
        )?;
        Ok(())
    }

    /// Newest transitions first, optionally for a single test.
    pub fn list_recent(
        &self,
        identity_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TransitionEvent>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.identity_id, COALESCE(i.title, t.identity_id), t.from_class, t.to_class,
                    t.flake_score, t.history_seq, t.created_at
             FROM transitions t LEFT JOIN identities i ON i.id = t.identity_id
             WHERE (?1 IS NULL OR t.identity_id = ?1)
             ORDER BY t.history_seq DESC, t.created_at DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![identity_id, sql_limit(limit)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut events = Vec::new();
        for r in rows {
            let (id, identity_id, title, from, to, flake_score, history_seq, at) = r?;
            events.push(TransitionEvent {
                id: Uuid::parse_str(&id)
                    .map_err(|e| StoreError::Corrupt(format!("bad transition id '{id}': {e}")))?,
                identity_id,
                title,
                from: parse_class(&from)?,
                to: parse_class(&to)?,
                flake_score,
                history_seq,
                at: decode_ts(&at)?,
            });
        }
        Ok(events)
    }
}

fn parse_class(s: &str) -> Result<Classification, StoreError> {
    Classification::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown classification '{s}'")))
}
