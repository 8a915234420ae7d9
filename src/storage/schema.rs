//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL UNIQUE,
            commit_sha TEXT NOT NULL,
            branch TEXT NOT NULL,
            started_at TEXT NOT NULL,
            environment_json TEXT NOT NULL,
            digest TEXT NOT NULL,
            result_count INTEGER NOT NULL,
            ingested_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS identities (
            id TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            title TEXT NOT NULL,
            first_file TEXT NOT NULL,
            last_file TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            last_seen_seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS history (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
            run_seq INTEGER NOT NULL REFERENCES runs(seq),
            status TEXT NOT NULL,
            was_retried INTEGER NOT NULL,
            attempts INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            error_signature TEXT NOT NULL DEFAULT '',
            file TEXT NOT NULL DEFAULT '',
            started_at TEXT NOT NULL,
            UNIQUE (identity_id, run_seq)
        );

        CREATE TABLE IF NOT EXISTS daily_rollups (
            day TEXT NOT NULL,
            branch TEXT NOT NULL,
            identity_id TEXT NOT NULL,
            runs INTEGER NOT NULL DEFAULT 0,
            passed INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            retried INTEGER NOT NULL DEFAULT 0,
            flaky INTEGER NOT NULL DEFAULT 0,
            duration_ms_sum INTEGER NOT NULL DEFAULT 0,
            duration_ms_max INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (day, branch, identity_id)
        );

        CREATE TABLE IF NOT EXISTS transitions (
            id TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL,
            from_class TEXT NOT NULL,
            to_class TEXT NOT NULL,
            flake_score REAL NOT NULL,
            history_seq INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS quarantine (
            identity_id TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_branch_started ON runs(branch, started_at);
        CREATE INDEX IF NOT EXISTS idx_identities_fingerprint ON identities(fingerprint);
        CREATE INDEX IF NOT EXISTS idx_history_identity_seq ON history(identity_id, seq);
        CREATE INDEX IF NOT EXISTS idx_history_run ON history(run_seq);
        CREATE INDEX IF NOT EXISTS idx_history_started ON history(started_at);
        CREATE INDEX IF NOT EXISTS idx_rollups_identity_day ON daily_rollups(identity_id, day);
        CREATE INDEX IF NOT EXISTS idx_transitions_created ON transitions(created_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
