//! Daily rollups: per (UTC day, branch, test) counters maintained in the same
//! transaction as each history append. Range queries read these instead of
//! scanning history.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::ingest::normalize::NormalizedResult;
use crate::ingest::TestStatus;
use crate::storage::{sql_limit, StoreError};

/// Inclusive range of UTC days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DayRange {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl DayRange {
    pub fn new(first: NaiveDate, last: NaiveDate) -> Self {
        Self { first, last }
    }

    /// The `days` days ending with `last`, inclusive. Zero days is empty.
    /// `None` when the first day falls outside the calendar.
    pub fn ending(last: NaiveDate, days: u32) -> Option<Self> {
        let first = last.checked_sub_signed(chrono::Duration::days(i64::from(days) - 1))?;
        Some(Self { first, last })
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }

    pub fn days(&self) -> i64 {
        (self.last - self.first).num_days() + 1
    }

    /// The range of equal length ending the day before this one starts, or
    /// `None` when that range falls outside the calendar.
    pub fn preceding(&self) -> Option<Self> {
        let len = chrono::Duration::days(self.days().max(1));
        Some(Self {
            first: self.first.checked_sub_signed(len)?,
            last: self.first.pred_opt()?,
        })
    }

    fn bounds(&self) -> (String, String) {
        (
            self.first.format("%Y-%m-%d").to_string(),
            self.last.format("%Y-%m-%d").to_string(),
        )
    }
}

/// Summed counters over some set of rollup rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollupTotals {
    pub runs: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retried: u64,
    pub flaky: u64,
    pub duration_ms_sum: u64,
    pub duration_ms_max: u64,
}

impl RollupTotals {
    /// Runs that actually executed (skips excluded).
    pub fn executed(&self) -> u64 {
        self.runs.saturating_sub(self.skipped)
    }

    fn ratio(&self, n: u64) -> Option<f64> {
        let executed = self.executed();
        (executed > 0).then(|| n as f64 / executed as f64)
    }

    pub fn pass_rate(&self) -> Option<f64> {
        self.ratio(self.passed)
    }

    pub fn fail_rate(&self) -> Option<f64> {
        self.ratio(self.failed)
    }

    pub fn flake_rate(&self) -> Option<f64> {
        self.ratio(self.flaky)
    }

    pub fn mean_duration_ms(&self) -> Option<f64> {
        self.ratio(self.duration_ms_sum)
    }
}

/// Add one appended result to its day bucket.
pub(crate) fn record(
    conn: &Connection,
    day: &str,
    branch: &str,
    identity_id: &str,
    result: &NormalizedResult,
) -> Result<(), StoreError> {
    let skipped = result.status == TestStatus::Skipped;
    let duration = if skipped { 0 } else { i64::try_from(result.duration_ms).unwrap_or(i64::MAX) };

    conn.execute(
        "INSERT INTO daily_rollups
            (day, branch, identity_id, runs, passed, failed, skipped, retried, flaky,
             duration_ms_sum, duration_ms_max)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT (day, branch, identity_id) DO UPDATE SET
            runs = runs + 1,
            passed = passed + excluded.passed,
            failed = failed + excluded.failed,
            skipped = skipped + excluded.skipped,
            retried = retried + excluded.retried,
            flaky = flaky + excluded.flaky,
            duration_ms_sum = duration_ms_sum + excluded.duration_ms_sum,
            duration_ms_max = MAX(duration_ms_max, excluded.duration_ms_max)",
        params![
            day,
            branch,
            identity_id,
            (result.status == TestStatus::Passed) as i64,
            (result.status == TestStatus::Failed) as i64,
            skipped as i64,
            result.was_retried() as i64,
            result.passed_after_retry() as i64,
            duration,
        ],
    )?;
    Ok(())
}

/// Sum rollups over `range`, optionally narrowed to one test and/or branch.
pub fn totals(
    conn: &Connection,
    range: &DayRange,
    identity_id: Option<&str>,
    branch: Option<&str>,
) -> Result<RollupTotals, StoreError> {
    if range.is_empty() {
        return Ok(RollupTotals::default());
    }
    let (first, last) = range.bounds();

    let totals = conn.query_row(
        "SELECT COALESCE(SUM(runs), 0), COALESCE(SUM(passed), 0), COALESCE(SUM(failed), 0),
                COALESCE(SUM(skipped), 0), COALESCE(SUM(retried), 0), COALESCE(SUM(flaky), 0),
                COALESCE(SUM(duration_ms_sum), 0), COALESCE(MAX(duration_ms_max), 0)
         FROM daily_rollups
         WHERE day BETWEEN ?1 AND ?2
           AND (?3 IS NULL OR identity_id = ?3)
           AND (?4 IS NULL OR branch = ?4)",
        params![first, last, identity_id, branch],
        |row| {
            Ok(RollupTotals {
                runs: row.get::<_, i64>(0)? as u64,
                passed: row.get::<_, i64>(1)? as u64,
                failed: row.get::<_, i64>(2)? as u64,
                skipped: row.get::<_, i64>(3)? as u64,
                retried: row.get::<_, i64>(4)? as u64,
                flaky: row.get::<_, i64>(5)? as u64,
                duration_ms_sum: row.get::<_, i64>(6)? as u64,
                duration_ms_max: row.get::<_, i64>(7)? as u64,
            })
        },
    )?;
    Ok(totals)
}

/// Per-test duration aggregate over a range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationRow {
    pub identity_id: String,
    pub title: String,
    pub executed: u64,
    pub mean_duration_ms: f64,
    pub max_duration_ms: u64,
}

/// The `n` tests with the highest mean duration over `range`.
pub fn slowest(conn: &Connection, range: &DayRange, n: usize) -> Result<Vec<DurationRow>, StoreError> {
    if range.is_empty() || n == 0 {
        return Ok(Vec::new());
    }
    let (first, last) = range.bounds();

    let mut stmt = conn.prepare(
        "SELECT r.identity_id, i.title,
                SUM(r.runs - r.skipped) AS executed,
                CAST(SUM(r.duration_ms_sum) AS REAL) / SUM(r.runs - r.skipped) AS mean_ms,
                MAX(r.duration_ms_max)
         FROM daily_rollups r
         JOIN identities i ON i.id = r.identity_id
         WHERE r.day BETWEEN ?1 AND ?2
         GROUP BY r.identity_id
         HAVING executed > 0
         ORDER BY mean_ms DESC, r.identity_id ASC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(params![first, last, sql_limit(n)], |row| {
        Ok(DurationRow {
            identity_id: row.get(0)?,
            title: row.get(1)?,
            executed: row.get::<_, i64>(2)? as u64,
            mean_duration_ms: row.get(3)?,
            max_duration_ms: row.get::<_, i64>(4)? as u64,
        })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}
