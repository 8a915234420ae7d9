//! Retention: age-based pruning that never cuts into a test's
//! classification window, and retirement of tests that left the suite.

use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::storage::{day_bucket, encode_ts, sql_limit, HistoryStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: chrono::Duration,
    /// Newest non-skipped entries per test that are never pruned.
    pub keep_latest: usize,
    /// Retire a test after this many consecutive runs without it. 0 disables.
    pub retire_after_absent_runs: u32,
}

impl RetentionPolicy {
    pub fn from_config(cfg: &RetentionConfig) -> Self {
        Self {
            max_age: chrono::Duration::days(i64::from(cfg.max_age_days)),
            keep_latest: cfg.keep_latest,
            retire_after_absent_runs: cfg.retire_after_absent_runs,
        }
    }

    /// Raise `keep_latest` to the classifier window so pruning can never
    /// shrink a window below its configured size.
    pub fn clamped_to_window(mut self, window_size: usize) -> Self {
        if self.keep_latest < window_size {
            warn!(
                requested = self.keep_latest,
                window_size, "keep_latest is below the classifier window, clamping"
            );
            self.keep_latest = window_size;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub cutoff: String,
    pub keep_latest: usize,
    pub entries_deleted: usize,
    pub rollups_deleted: usize,
    pub retired: Vec<String>,
}

impl HistoryStore {
    /// Remove history older than `now - policy.max_age`, keeping at least
    /// `window_size` (or `policy.keep_latest`, whichever is larger) newest
    /// classifiable entries for every test. Runs in a single transaction.
    pub fn prune(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        window_size: usize,
    ) -> Result<PruneReport, StoreError> {
        let policy = policy.clone().clamped_to_window(window_size);
        let cutoff_ts = now - policy.max_age;
        let cutoff = encode_ts(&cutoff_ts);
        let cutoff_day = day_bucket(&cutoff_ts);

        let mut conn = self.pool().get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut retired = Vec::new();
        if policy.retire_after_absent_runs > 0 {
            let mut stmt = tx.prepare(
                "SELECT id FROM identities
                 WHERE (SELECT COUNT(*) FROM runs WHERE runs.seq > identities.last_seen_seq) >= ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![policy.retire_after_absent_runs], |row| {
                row.get::<_, String>(0)
            })?;
            for r in rows {
                retired.push(r?);
            }
        }

        let mut entries_deleted = 0;
        let mut rollups_deleted = 0;
        for id in &retired {
            entries_deleted += tx.execute("DELETE FROM history WHERE identity_id = ?1", params![id])?;
            rollups_deleted +=
                tx.execute("DELETE FROM daily_rollups WHERE identity_id = ?1", params![id])?;
            tx.execute("DELETE FROM quarantine WHERE identity_id = ?1", params![id])?;
            tx.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        }

        entries_deleted += tx.execute(
            "DELETE FROM history WHERE seq IN (
                SELECT seq FROM (
                    SELECT seq, started_at,
                           ROW_NUMBER() OVER (PARTITION BY identity_id ORDER BY seq DESC) AS rn
                    FROM history WHERE status != 'skipped'
                )
                WHERE rn > ?1 AND started_at < ?2
             )",
            params![sql_limit(policy.keep_latest), cutoff],
        )?;
        entries_deleted += tx.execute(
            "DELETE FROM history WHERE status = 'skipped' AND started_at < ?1",
            params![cutoff],
        )?;
        rollups_deleted +=
            tx.execute("DELETE FROM daily_rollups WHERE day < ?1", params![cutoff_day])?;

        tx.commit()?;

        let report = PruneReport {
            cutoff,
            keep_latest: policy.keep_latest,
            entries_deleted,
            rollups_deleted,
            retired,
        };
        info!(
            cutoff = %report.cutoff,
            entries = report.entries_deleted,
            rollups = report.rollups_deleted,
            retired = report.retired.len(),
            "history pruned"
        );
        Ok(report)
    }
}
