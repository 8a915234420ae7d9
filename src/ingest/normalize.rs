//! Validation and canonicalisation of submitted run records.

use std::collections::HashSet;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::identity::canonical_title;
use crate::ingest::{failed_then_passed, Attempt, IngestError, RunRecord, TestStatus};

const MAX_SIGNATURE_CHARS: usize = 240;

/// A validated run, ready for identity resolution and append.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRun {
    pub run_id: String,
    pub commit: String,
    pub branch: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub environment: std::collections::BTreeMap<String, String>,
    pub results: Vec<NormalizedResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedResult {
    pub canonical_title: String,
    pub file: String,
    pub status: TestStatus,
    pub attempts: Vec<Attempt>,
    pub duration_ms: u64,
    pub error_signature: String,
}

impl NormalizedResult {
    pub fn was_retried(&self) -> bool {
        self.attempts.len() > 1
    }

    /// Failed on an attempt and passed on a later one.
    pub fn passed_after_retry(&self) -> bool {
        failed_then_passed(&self.attempts)
    }
}

impl NormalizedRun {
    /// SHA-256 over the canonical JSON encoding. Equal digests mean the same
    /// run content.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

/// Validate a submitted record and bring it into canonical form.
///
/// Checks `cancel` between results; once it fires the record is rejected
/// with [`IngestError::Cancelled`] and nothing has been written.
pub fn normalize_run(
    record: &RunRecord,
    cancel: &CancellationToken,
) -> Result<NormalizedRun, IngestError> {
    let run_id = record.run_id.trim().to_string();
    let invalid = |reason: String| IngestError::InvalidRecord {
        run_id: run_id.clone(),
        reason,
    };

    if run_id.is_empty() {
        return Err(invalid("run_id is blank".to_string()));
    }
    if record.branch.trim().is_empty() {
        return Err(invalid("branch is blank".to_string()));
    }
    if record.results.is_empty() {
        return Err(IngestError::EmptyRun { run_id });
    }

    let mut seen = HashSet::with_capacity(record.results.len());
    let mut results = Vec::with_capacity(record.results.len());

    for (idx, raw) in record.results.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled { run_id });
        }

        let title = canonical_title(&raw.title_path);
        if title.is_empty() {
            return Err(invalid(format!("result #{idx} has an empty title path")));
        }
        if !seen.insert(title.clone()) {
            return Err(invalid(format!("test '{title}' is reported more than once")));
        }

        let attempts = if raw.attempts.is_empty() {
            vec![Attempt {
                status: raw.status,
                duration_ms: raw.duration_ms,
            }]
        } else {
            raw.attempts.clone()
        };

        if let Some(last) = attempts.last() {
            if last.status != raw.status {
                return Err(invalid(format!(
                    "test '{title}' has final status {} but its last attempt was {}",
                    raw.status, last.status
                )));
            }
        }
        // Retries follow failures only.
        if let Some(early) = attempts
            .iter()
            .rev()
            .skip(1)
            .find(|a| a.status != TestStatus::Failed)
        {
            return Err(invalid(format!(
                "test '{title}' was retried after a {} attempt",
                early.status
            )));
        }

        let error_signature = if raw.status == TestStatus::Passed {
            String::new()
        } else {
            raw.error
                .as_deref()
                .map(normalize_error_signature)
                .unwrap_or_default()
        };

        results.push(NormalizedResult {
            canonical_title: title,
            file: raw.file.trim().to_string(),
            status: raw.status,
            attempts,
            duration_ms: raw.duration_ms,
            error_signature,
        });
    }

    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled { run_id });
    }

    Ok(NormalizedRun {
        run_id,
        commit: record.commit.trim().to_string(),
        branch: record.branch.trim().to_string(),
        started_at: record.started_at,
        environment: record.environment.clone(),
        results,
    })
}

/// Reduce an error message to a stable signature: the first non-empty line,
/// hex addresses and digit runs masked, capped in length.
pub fn normalize_error_signature(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '0' && matches!(chars.peek(), Some('x') | Some('X')) {
            chars.next();
            while chars.peek().is_some_and(|n| n.is_ascii_hexdigit()) {
                chars.next();
            }
            out.push_str("0x?");
        } else if c.is_ascii_digit() {
            while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                chars.next();
            }
            out.push('N');
        } else {
            out.push(c);
        }
    }

    out.chars().take(MAX_SIGNATURE_CHARS).collect()
}
