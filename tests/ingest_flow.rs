//! End-to-end ingest behaviour through the public API: idempotence, identity
//! stability, classification scenarios, rollback and pruning.

use chrono::{DateTime, Duration, TimeZone, Utc};
use flakewatch::classify::Classification;
use flakewatch::config::FlakewatchConfig;
use flakewatch::engine::Flakewatch;
use flakewatch::ingest::{Attempt, IngestError, RunRecord, TestResult, TestStatus};
use flakewatch::storage::{HistoryWindow, RetentionPolicy};

#[derive(Clone, Copy)]
enum Outcome {
    Pass,
    Fail,
    FailThenPass,
    FailTwice,
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 6, 0, 0).unwrap()
}

fn result(title: &[&str], file: &str, outcome: Outcome) -> TestResult {
    let attempts: Vec<TestStatus> = match outcome {
        Outcome::Pass => vec![TestStatus::Passed],
        Outcome::Fail => vec![TestStatus::Failed],
        Outcome::FailThenPass => vec![TestStatus::Failed, TestStatus::Passed],
        Outcome::FailTwice => vec![TestStatus::Failed, TestStatus::Failed],
    };
    let status = *attempts.last().unwrap();
    TestResult {
        title_path: title.iter().map(|s| s.to_string()).collect(),
        file: file.into(),
        status,
        attempts: attempts
            .into_iter()
            .map(|status| Attempt { status, duration_ms: 150 })
            .collect(),
        duration_ms: 150,
        error: (status == TestStatus::Failed).then(|| "Timeout 30000ms exceeded at 0x7ffe12".to_string()),
    }
}

fn record(run_id: &str, offset_min: i64, results: Vec<TestResult>) -> RunRecord {
    RunRecord {
        run_id: run_id.into(),
        commit: format!("sha-{run_id}"),
        branch: "main".into(),
        started_at: base_time() + Duration::minutes(offset_min),
        environment: [("os".to_string(), "linux".to_string())].into_iter().collect(),
        results,
    }
}

async fn open(dir: &tempfile::TempDir) -> Flakewatch {
    let mut config = FlakewatchConfig::default();
    config.storage.db_path = dir.path().join("flow.db");
    Flakewatch::open(config).await.unwrap()
}

fn table_count(app: &Flakewatch, table: &str) -> i64 {
    app.store()
        .pool()
        .get()
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

/// Ingest one "Login flow" result per outcome and return its identity key.
async fn ingest_login(app: &Flakewatch, prefix: &str, outcomes: &[Outcome]) -> String {
    for (i, outcome) in outcomes.iter().enumerate() {
        app.ingest(record(
            &format!("{prefix}-{i}"),
            i as i64,
            vec![result(&["auth", "Login flow"], "auth/login.spec.ts", *outcome)],
        ))
        .await
        .unwrap();
    }
    app.store().identity_ids().unwrap().remove(0)
}

#[tokio::test]
async fn test_identical_run_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    let run = record(
        "ci-100",
        0,
        vec![
            result(&["auth", "Login flow"], "auth.spec.ts", Outcome::FailThenPass),
            result(&["auth", "Logout"], "auth.spec.ts", Outcome::Pass),
        ],
    );

    app.ingest(run.clone()).await.unwrap();
    let before: Vec<i64> = ["runs", "history", "identities", "daily_rollups"]
        .iter()
        .map(|t| table_count(&app, t))
        .collect();

    let err = app.ingest(run).await.unwrap_err();
    assert!(matches!(err, IngestError::DuplicateRun { .. }));
    assert!(err.is_benign());

    let after: Vec<i64> = ["runs", "history", "identities", "daily_rollups"]
        .iter()
        .map(|t| table_count(&app, t))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_conflicting_run_rejected_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    app.ingest(record("ci-1", 0, vec![result(&["a"], "a.ts", Outcome::Pass)]))
        .await
        .unwrap();

    let err = app
        .ingest(record("ci-1", 0, vec![result(&["a"], "a.ts", Outcome::Fail)]))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ConflictingRun { .. }));
    assert_eq!(table_count(&app, "history"), 1);
}

#[tokio::test]
async fn test_empty_and_invalid_runs_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;

    let err = app.ingest(record("empty", 0, vec![])).await.unwrap_err();
    assert!(matches!(err, IngestError::EmptyRun { .. }));

    let twice = vec![
        result(&["a"], "a.ts", Outcome::Pass),
        result(&["a"], "b.ts", Outcome::Pass),
    ];
    let err = app.ingest(record("twice", 0, twice)).await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidRecord { .. }));

    assert_eq!(table_count(&app, "runs"), 0);
}

#[tokio::test]
async fn test_identity_survives_file_move() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;

    let first = app
        .ingest(record("r1", 0, vec![result(&["cart", "checkout"], "old/cart.spec.ts", Outcome::Pass)]))
        .await
        .unwrap();
    let second = app
        .ingest(record("r2", 1, vec![result(&["cart", "checkout"], "new/cart.spec.ts", Outcome::Pass)]))
        .await
        .unwrap();

    assert_eq!(first.new_identities.len(), 1);
    assert!(second.new_identities.is_empty());

    let id = &first.new_identities[0];
    let identity = app.store().identity(id).unwrap().unwrap();
    assert_eq!(identity.first_file, "old/cart.spec.ts");
    assert_eq!(identity.last_file, "new/cart.spec.ts");
    assert_eq!(app.store().entry_count(id).unwrap(), 2);
}

#[tokio::test]
async fn test_login_flow_scenario_is_flaky() {
    use Outcome::*;
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    let id = ingest_login(&app, "login", &[Pass, Pass, FailThenPass, Pass, FailThenPass]).await;

    let state = app.query().classification(&id).unwrap();
    assert_eq!(state.window_size, 5);
    assert!((state.flake_rate - 0.40).abs() < 1e-12);
    assert_eq!(state.classification, Classification::Flaky);

    let transitions = app.query().transitions(Some(&id), 10).unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].from, Classification::InsufficientData);
    assert_eq!(transitions[0].to, Classification::Flaky);
}

#[tokio::test]
async fn test_trailing_failures_are_consistently_failing() {
    use Outcome::*;
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    let id = ingest_login(
        &app,
        "login",
        &[Pass, FailThenPass, FailThenPass, Fail, FailTwice, Fail],
    )
    .await;

    let state = app.query().classification(&id).unwrap();
    assert!(state.flake_rate >= 0.10);
    assert_eq!(state.consecutive_fail_streak, 3);
    assert_eq!(state.classification, Classification::ConsistentlyFailing);
    assert_eq!(state.last_error_signature, "Timeout Nms exceeded at 0x?");
}

#[tokio::test]
async fn test_window_grows_monotonically_until_full() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    let mut last = 0;
    for i in 0..25 {
        app.ingest(record(&format!("r{i}"), i, vec![result(&["a"], "a.ts", Outcome::Pass)]))
            .await
            .unwrap();
        let id = app.store().identity_ids().unwrap().remove(0);
        let size = app.query().classification(&id).unwrap().window_size;
        assert!(size >= last, "window shrank from {last} to {size}");
        assert!(size <= 20);
        last = size;
    }
    assert_eq!(last, 20);
}

#[tokio::test]
async fn test_storage_fault_is_rolled_back_and_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    app.store()
        .pool()
        .get()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER injected BEFORE INSERT ON history
             WHEN NEW.status = 'failed'
             BEGIN SELECT RAISE(ABORT, 'disk on fire'); END;",
        )
        .unwrap();

    let run = record(
        "ci-7",
        0,
        vec![
            result(&["a"], "a.ts", Outcome::Pass),
            result(&["b"], "b.ts", Outcome::Fail),
        ],
    );
    let err = app.ingest(run.clone()).await.unwrap_err();
    assert!(matches!(err, IngestError::PartialIngestFailure { .. }));
    assert!(err.is_retryable());
    for table in ["runs", "history", "identities", "daily_rollups"] {
        assert_eq!(table_count(&app, table), 0, "{table} not rolled back");
    }

    app.store()
        .pool()
        .get()
        .unwrap()
        .execute_batch("DROP TRIGGER injected;")
        .unwrap();
    let report = app.ingest(run).await.unwrap();
    assert_eq!(report.entries, 2);
    assert_eq!(report.new_identities.len(), 2);
}

#[tokio::test]
async fn test_out_of_order_run_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    app.ingest(record("late", 60, vec![result(&["a"], "a.ts", Outcome::Pass)]))
        .await
        .unwrap();
    let report = app
        .ingest(record("early", 0, vec![result(&["a"], "a.ts", Outcome::Fail)]))
        .await
        .unwrap();
    assert!(report.out_of_order);

    let id = app.store().identity_ids().unwrap().remove(0);
    let newest = app.query().history(&id, HistoryWindow::Latest(1)).unwrap();
    assert_eq!(newest[0].run_id, "early");
}

#[tokio::test]
async fn test_pruning_never_cuts_into_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    for i in 0..30 {
        app.ingest(record(
            &format!("r{i}"),
            i * 60 * 24,
            vec![result(&["a"], "a.ts", Outcome::Pass)],
        ))
        .await
        .unwrap();
    }
    let id = app.store().identity_ids().unwrap().remove(0);
    let before = app.query().classification(&id).unwrap();

    // A one-day horizon with keep_latest below the window must clamp.
    let policy = RetentionPolicy {
        max_age: Duration::days(1),
        keep_latest: 3,
        retire_after_absent_runs: 0,
    };
    let report = app
        .store()
        .prune(&policy, base_time() + Duration::days(400), 20)
        .unwrap();
    assert_eq!(report.keep_latest, 20);
    assert_eq!(app.store().entry_count(&id).unwrap(), 20);

    app.classifier().recompute(&id).await.unwrap();
    let after = app.query().classification(&id).unwrap();
    assert_eq!(after.window_size, before.window_size);
    assert_eq!(after.classification, before.classification);
}

#[tokio::test]
async fn test_retirement_by_another_process_does_not_wedge_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open(&dir).await;
    daemon
        .ingest(record(
            "r0",
            0,
            vec![
                result(&["gone"], "a.ts", Outcome::Pass),
                result(&["stays"], "a.ts", Outcome::Pass),
            ],
        ))
        .await
        .unwrap();
    for i in 1..=2 {
        daemon
            .ingest(record(&format!("r{i}"), i, vec![result(&["stays"], "a.ts", Outcome::Pass)]))
            .await
            .unwrap();
    }

    // A second process on the same database retires the absent test.
    let mut config = FlakewatchConfig::default();
    config.storage.db_path = dir.path().join("flow.db");
    config.retention.retire_after_absent_runs = 2;
    let cli = Flakewatch::open(config).await.unwrap();
    let pruned = cli.prune().await.unwrap();
    assert_eq!(pruned.retired.len(), 1);
    let retired = pruned.retired[0].clone();

    let report = daemon
        .ingest(record("r3", 3, vec![result(&["gone"], "a.ts", Outcome::Fail)]))
        .await
        .unwrap();
    assert_eq!(report.new_identities, vec![retired.clone()]);
    assert_eq!(daemon.store().entry_count(&retired).unwrap(), 1);

    let state = daemon.query().classification(&retired).unwrap();
    assert_eq!(state.window_size, 1);
    assert_eq!(state.classification, Classification::InsufficientData);
}

#[tokio::test]
async fn test_repeated_pass_is_not_a_flake() {
    let dir = tempfile::tempdir().unwrap();
    let app = open(&dir).await;
    let mut twice = result(&["a"], "a.ts", Outcome::Pass);
    twice.attempts = vec![
        Attempt { status: TestStatus::Passed, duration_ms: 10 },
        Attempt { status: TestStatus::Passed, duration_ms: 10 },
    ];
    assert!(!twice.is_flaky());

    let err = app.ingest(record("r1", 0, vec![twice])).await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidRecord { .. }));
    assert_eq!(table_count(&app, "daily_rollups"), 0);

    app.ingest(record("r2", 1, vec![result(&["a"], "a.ts", Outcome::FailThenPass)]))
        .await
        .unwrap();
    let day = base_time().date_naive();
    let report = app
        .query()
        .flake_rate(&flakewatch::query::Scope::All, flakewatch::storage::DayRange::new(day, day))
        .unwrap();
    assert_eq!(report.flaky, 1);
    assert_eq!(report.flake_rate, Some(1.0));
}
