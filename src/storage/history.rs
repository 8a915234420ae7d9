//! Append-only, per-test outcome history.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::debug;

use crate::identity::resolver::load_identity;
use crate::identity::{IdentityResolver, TestIdentity};
use crate::ingest::normalize::{NormalizedResult, NormalizedRun};
use crate::ingest::TestStatus;
use crate::storage::{day_bucket, decode_ts, encode_ts, rollup, sql_limit, Pool, StoreError};

/// The stored projection of one test's result in one run. Never updated
/// after append; retention removes whole entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Ingestion sequence. Strictly increasing in append order.
    pub seq: i64,
    pub identity_id: String,
    pub run_id: String,
    pub branch: String,
    pub commit: String,
    pub status: TestStatus,
    pub was_retried: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error_signature: String,
    pub file: String,
    pub started_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Failed, was retried and ended up passing. Ingest only accepts
    /// retries after failed attempts, so a retried pass is a fail-then-pass.
    pub fn passed_after_retry(&self) -> bool {
        self.was_retried && self.status == TestStatus::Passed
    }
}

/// Which entries of a test to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    /// The newest `n` entries.
    Latest(usize),
    /// Entries whose run started at or after the instant.
    Since(DateTime<Utc>),
    /// Entries whose run started in `[start, end)`.
    Between(DateTime<Utc>, DateTime<Utc>),
}

/// One entry written by [`HistoryStore::append_run`].
#[derive(Debug, Clone)]
pub struct AppendedEntry {
    pub identity: TestIdentity,
    pub seq: i64,
    pub is_new: bool,
    pub moved_from: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub run_seq: i64,
    pub entries: Vec<AppendedEntry>,
    /// The run started earlier than a run already stored for its branch.
    pub out_of_order: bool,
}

/// Result of trying to append a run.
#[derive(Debug)]
pub enum AppendResult {
    Appended(AppendOutcome),
    /// Same run id, same digest. Nothing written.
    Duplicate,
    /// Same run id, different digest. Nothing written.
    Conflict,
}

/// Identifying data of a stored run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub seq: i64,
    pub run_id: String,
    pub commit: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub result_count: u64,
}

/// A test reported by a specific run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunTest {
    pub identity_id: String,
    pub title: String,
    pub status: TestStatus,
}

const ENTRY_COLUMNS: &str = "h.seq, h.identity_id, r.run_id, r.branch, r.commit_sha, h.status,
     h.was_retried, h.attempts, h.duration_ms, h.error_signature, h.file, h.started_at";

/// SQLite-backed history multimap keyed by test identity.
#[derive(Clone)]
pub struct HistoryStore {
    pool: Pool,
}

impl HistoryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Append every result of `run` in one transaction. Either all entries,
    /// the run row, the new identities and the rollup increments commit, or
    /// none of them do.
    pub fn append_run(
        &self,
        resolver: &IdentityResolver,
        run: &NormalizedRun,
        digest: &str,
    ) -> Result<AppendResult, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT digest FROM runs WHERE run_id = ?1",
                params![run.run_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(stored) = existing {
            return Ok(if stored == digest {
                AppendResult::Duplicate
            } else {
                AppendResult::Conflict
            });
        }

        let started_at = encode_ts(&run.started_at);
        let latest_on_branch: Option<String> = tx.query_row(
            "SELECT MAX(started_at) FROM runs WHERE branch = ?1",
            params![run.branch],
            |row| row.get(0),
        )?;
        let out_of_order = latest_on_branch.is_some_and(|latest| latest > started_at);

        tx.execute(
            "INSERT INTO runs (run_id, commit_sha, branch, started_at, environment_json, digest, result_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.run_id,
                run.commit,
                run.branch,
                started_at,
                serde_json::to_string(&run.environment)?,
                digest,
                run.results.len() as i64,
            ],
        )?;
        let run_seq = tx.last_insert_rowid();
        let day = day_bucket(&run.started_at);

        let mut entries = Vec::with_capacity(run.results.len());
        for result in &run.results {
            let resolved =
                resolver.resolve(&tx, &result.canonical_title, &result.file, run_seq, &started_at)?;
            let seq = append_entry(&tx, &resolved.identity.id, run_seq, result, &started_at)?;
            rollup::record(&tx, &day, &run.branch, &resolved.identity.id, result)?;

            entries.push(AppendedEntry {
                identity: resolved.identity,
                seq,
                is_new: resolved.is_new,
                moved_from: resolved.moved_from,
            });
        }

        tx.commit()?;
        debug!(run_id = %run.run_id, run_seq, entries = entries.len(), "run appended");

        Ok(AppendResult::Appended(AppendOutcome {
            run_seq,
            entries,
            out_of_order,
        }))
    }

    /// Entries of one test inside `window`, newest first. Unknown tests
    /// yield an empty list.
    pub fn query(
        &self,
        identity_id: &str,
        window: HistoryWindow,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.pool.get()?;
        match window {
            HistoryWindow::Latest(n) => collect_entries(
                &conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM history h JOIN runs r ON r.seq = h.run_seq
                     WHERE h.identity_id = ?1 ORDER BY h.seq DESC LIMIT ?2"
                ),
                params![identity_id, sql_limit(n)],
            ),
            HistoryWindow::Since(start) => collect_entries(
                &conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM history h JOIN runs r ON r.seq = h.run_seq
                     WHERE h.identity_id = ?1 AND h.started_at >= ?2 ORDER BY h.seq DESC"
                ),
                params![identity_id, encode_ts(&start)],
            ),
            HistoryWindow::Between(start, end) => collect_entries(
                &conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM history h JOIN runs r ON r.seq = h.run_seq
                     WHERE h.identity_id = ?1 AND h.started_at >= ?2 AND h.started_at < ?3
                     ORDER BY h.seq DESC"
                ),
                params![identity_id, encode_ts(&start), encode_ts(&end)],
            ),
        }
    }

    /// The newest `size` non-skipped entries of a test, newest first. This is
    /// the window the classifier works on.
    pub fn classification_window(
        &self,
        identity_id: &str,
        size: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.pool.get()?;
        collect_entries(
            &conn,
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM history h JOIN runs r ON r.seq = h.run_seq
                 WHERE h.identity_id = ?1 AND h.status != 'skipped'
                 ORDER BY h.seq DESC LIMIT ?2"
            ),
            params![identity_id, sql_limit(size)],
        )
    }

    pub fn identity(&self, id: &str) -> Result<Option<TestIdentity>, StoreError> {
        let conn = self.pool.get()?;
        load_identity(&conn, id)
    }

    /// Keys of every known test.
    pub fn identity_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT id FROM identities ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for r in rows {
            ids.push(r?);
        }
        Ok(ids)
    }

    pub fn entry_count(&self, identity_id: &str) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM history WHERE identity_id = ?1",
            params![identity_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn run(&self, run_id: &str) -> Result<Option<RunSummary>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT seq, run_id, commit_sha, branch, started_at, result_count
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((seq, run_id, commit, branch, started_at, count)) => Ok(Some(RunSummary {
                seq,
                run_id,
                commit,
                branch,
                started_at: decode_ts(&started_at)?,
                result_count: count as u64,
            })),
            None => Ok(None),
        }
    }

    /// Tests reported by a run, or `None` if the run is unknown.
    pub fn run_tests(&self, run_id: &str) -> Result<Option<Vec<RunTest>>, StoreError> {
        let Some(run) = self.run(run_id)? else {
            return Ok(None);
        };
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT h.identity_id, i.title, h.status FROM history h
             JOIN identities i ON i.id = h.identity_id
             WHERE h.run_seq = ?1 ORDER BY h.seq",
        )?;
        let rows = stmt.query_map(params![run.seq], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut tests = Vec::new();
        for r in rows {
            let (identity_id, title, status) = r?;
            tests.push(RunTest {
                identity_id,
                title,
                status: parse_status(&status)?,
            });
        }
        Ok(Some(tests))
    }
}

/// Write a single history entry and return its sequence number.
pub(crate) fn append_entry(
    conn: &Connection,
    identity_id: &str,
    run_seq: i64,
    result: &NormalizedResult,
    started_at: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO history
            (identity_id, run_seq, status, was_retried, attempts, duration_ms, error_signature, file, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            identity_id,
            run_seq,
            result.status.as_str(),
            result.was_retried() as i64,
            result.attempts.len() as i64,
            i64::try_from(result.duration_ms).unwrap_or(i64::MAX),
            result.error_signature,
            result.file,
            started_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn parse_status(s: &str) -> Result<TestStatus, StoreError> {
    TestStatus::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown status '{s}'")))
}

fn collect_entries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<HistoryEntry>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, i64>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, i64>(8)?,
            row.get::<_, String>(9)?,
            row.get::<_, String>(10)?,
            row.get::<_, String>(11)?,
        ))
    })?;

    let mut entries = Vec::new();
    for r in rows {
        let (seq, identity_id, run_id, branch, commit, status, retried, attempts, duration, sig, file, started) =
            r?;
        entries.push(HistoryEntry {
            seq,
            identity_id,
            run_id,
            branch,
            commit,
            status: parse_status(&status)?,
            was_retried: retried != 0,
            attempts: attempts as u32,
            duration_ms: duration as u64,
            error_signature: sig,
            file,
            started_at: decode_ts(&started)?,
        });
    }
    Ok(entries)
}
