//! Smoke tests -- verify the binary runs and the one-shot commands work
//! against a scratch database.

use assert_cmd::Command;
use predicates::prelude::*;

fn flakewatch(db: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("flakewatch").unwrap();
    cmd.env_remove("FLAKEWATCH_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--db")
        .arg(db);
    cmd
}

fn run_json(run_id: &str, minute: u32, status: &str) -> String {
    format!(
        r#"{{
            "run_id": "{run_id}",
            "commit": "c-{run_id}",
            "branch": "main",
            "started_at": "2026-10-01T10:{minute:02}:00Z",
            "results": [
                {{ "title_path": ["cart", "adds item"], "file": "cart.spec.ts", "status": "{status}", "duration_ms": 80 }},
                {{ "title_path": ["cart", "removes item"], "file": "cart.spec.ts", "status": "passed", "duration_ms": 40 }}
            ]
        }}"#
    )
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("flakewatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Flaky-test detection"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("flakewatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("flakewatch"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["ingest", "--help"],
        vec!["trend", "--help"],
        vec!["quarantine", "add", "--help"],
        vec!["prune", "--help"],
    ] {
        Command::cargo_bin("flakewatch")
            .unwrap()
            .args(&args)
            .assert()
            .success();
    }
}

#[test]
fn test_ingest_then_status() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("smoke.db");
    let input = dir.path().join("run.json");
    std::fs::write(&input, run_json("ci-1", 0, "passed")).unwrap();

    flakewatch(&db)
        .arg("ingest")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicates::str::contains("ci-1: 2 results, 2 new tests"));

    flakewatch(&db)
        .arg("ingest")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicates::str::contains("duplicate"));

    flakewatch(&db)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("cart › adds item").and(predicates::str::contains("insufficient_data")));
}

#[test]
fn test_conflicting_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("smoke.db");
    let first = dir.path().join("a.json");
    let second = dir.path().join("b.json");
    std::fs::write(&first, run_json("ci-1", 0, "passed")).unwrap();
    std::fs::write(&second, run_json("ci-1", 0, "failed")).unwrap();

    flakewatch(&db).arg("ingest").arg(&first).assert().success();
    flakewatch(&db)
        .arg("ingest")
        .arg(&second)
        .assert()
        .failure()
        .stderr(predicates::str::contains("different content"));
}

#[test]
fn test_gate_blocks_consistently_failing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("smoke.db");
    let input = dir.path().join("runs.json");
    let runs: Vec<String> = (0..5)
        .map(|i| run_json(&format!("ci-{i}"), i, "failed"))
        .collect();
    std::fs::write(&input, format!("[{}]", runs.join(","))).unwrap();

    flakewatch(&db).arg("ingest").arg(&input).assert().success();
    flakewatch(&db)
        .args(["gate", "ci-4"])
        .assert()
        .code(2)
        .stdout(predicates::str::contains("BLOCK"));
    flakewatch(&db).args(["gate", "missing"]).assert().failure();
}

#[test]
fn test_range_outside_calendar_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("smoke.db");
    flakewatch(&db)
        .args(["flake-rate", "--days", "4294967295"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("outside the calendar"));
}
