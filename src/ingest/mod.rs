//! Run record ingestion -- validation, normalization and atomic append.

pub mod ingestor;
pub mod normalize;

pub use self::ingestor::{IngestReport, Ingestor};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;

/// Final or per-attempt outcome of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(TestStatus::Passed),
            "failed" => Some(TestStatus::Failed),
            "skipped" => Some(TestStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One try of a test within a run. Retries produce several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub status: TestStatus,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Outcome of one test inside one CI run, as submitted by a reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Suite › describe › test name, outermost first.
    pub title_path: Vec<String>,
    /// Source file the test was found in for this run.
    #[serde(default)]
    pub file: String,
    pub status: TestStatus,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl TestResult {
    /// More than one attempt was needed.
    pub fn was_retried(&self) -> bool {
        self.attempts.len() > 1
    }

    /// Failed on some attempt and passed on a later one within the same run.
    pub fn is_flaky(&self) -> bool {
        failed_then_passed(&self.attempts)
    }
}

/// Some attempt failed and a later one passed.
pub fn failed_then_passed(attempts: &[Attempt]) -> bool {
    let mut seen_failure = false;
    for attempt in attempts {
        match attempt.status {
            TestStatus::Failed => seen_failure = true,
            TestStatus::Passed if seen_failure => return true,
            _ => {}
        }
    }
    false
}

/// One CI execution: many test results from a single commit on a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(default)]
    pub commit: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    /// Opaque descriptors such as OS, browser, worker count.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub results: Vec<TestResult>,
}

/// Reasons a run record is not (or not newly) ingested.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("run '{run_id}' was already ingested with identical content")]
    DuplicateRun { run_id: String },

    #[error("run '{run_id}' was already ingested with different content")]
    ConflictingRun { run_id: String },

    #[error("run '{run_id}' contains no test results")]
    EmptyRun { run_id: String },

    #[error("run '{run_id}' is malformed: {reason}")]
    InvalidRecord { run_id: String, reason: String },

    #[error("ingest of run '{run_id}' was cancelled before any append")]
    Cancelled { run_id: String },

    #[error("storage fault while appending run '{run_id}', all appends rolled back: {source}")]
    PartialIngestFailure {
        run_id: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    /// A duplicate submission leaves the store exactly as it was.
    pub fn is_benign(&self) -> bool {
        matches!(self, IngestError::DuplicateRun { .. })
    }

    /// The caller may resubmit the same payload.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::PartialIngestFailure { .. } | IngestError::Cancelled { .. }
        )
    }

    pub fn run_id(&self) -> &str {
        match self {
            IngestError::DuplicateRun { run_id }
            | IngestError::ConflictingRun { run_id }
            | IngestError::EmptyRun { run_id }
            | IngestError::InvalidRecord { run_id, .. }
            | IngestError::Cancelled { run_id }
            | IngestError::PartialIngestFailure { run_id, .. } => run_id,
        }
    }
}
