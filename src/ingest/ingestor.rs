use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::{ClassifyError, FlakeClassifier, TransitionEvent};
use crate::identity::IdentityResolver;
use crate::ingest::normalize::normalize_run;
use crate::ingest::{IngestError, RunRecord};
use crate::storage::{AppendResult, HistoryStore, StoreError};

/// What a successful ingest did.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: String,
    pub run_seq: i64,
    /// History entries stored, one per test result.
    pub entries: usize,
    /// Identity keys seen for the first time in this run.
    pub new_identities: Vec<String>,
    pub out_of_order: bool,
    pub transitions: Vec<TransitionEvent>,
}

/// Validates run records, appends them atomically and triggers
/// reclassification of every test they touch.
#[derive(Clone)]
pub struct Ingestor {
    store: HistoryStore,
    resolver: Arc<IdentityResolver>,
    classifier: Arc<FlakeClassifier>,
}

impl Ingestor {
    pub fn new(store: HistoryStore, resolver: Arc<IdentityResolver>, classifier: Arc<FlakeClassifier>) -> Self {
        Self {
            store,
            resolver,
            classifier,
        }
    }

    pub async fn ingest(&self, record: RunRecord) -> Result<IngestReport, IngestError> {
        self.ingest_with_cancel(record, CancellationToken::new()).await
    }

    /// Ingest one run. `cancel` is honoured until the append starts.
    pub async fn ingest_with_cancel(
        &self,
        record: RunRecord,
        cancel: CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let run_id = record.run_id.clone();

        let run = normalize_run(&record, &cancel).map_err(|e| {
            warn!(run_id = %run_id, reason = %e, "run rejected");
            e
        })?;
        let digest = run.digest().map_err(|e| IngestError::InvalidRecord {
            run_id: run_id.clone(),
            reason: format!("cannot encode run: {e}"),
        })?;
        if cancel.is_cancelled() {
            warn!(run_id = %run_id, "ingest cancelled before append");
            return Err(IngestError::Cancelled { run_id });
        }

        let store = self.store.clone();
        let resolver = Arc::clone(&self.resolver);
        let appended = tokio::task::spawn_blocking(move || store.append_run(&resolver, &run, &digest))
            .await
            .map_err(StoreError::from)
            .and_then(|r| r);

        let outcome = match appended {
            Ok(AppendResult::Appended(outcome)) => outcome,
            Ok(AppendResult::Duplicate) => {
                info!(run_id = %run_id, "duplicate run ignored");
                return Err(IngestError::DuplicateRun { run_id });
            }
            Ok(AppendResult::Conflict) => {
                warn!(run_id = %run_id, "run id reused with different content, rejected");
                return Err(IngestError::ConflictingRun { run_id });
            }
            Err(source) => {
                error!(run_id = %run_id, error = %source, "storage fault, run rolled back");
                return Err(IngestError::PartialIngestFailure { run_id, source });
            }
        };

        self.resolver
            .remember(outcome.entries.iter().map(|e| e.identity.clone()));

        if outcome.out_of_order {
            warn!(
                run_id = %run_id,
                branch = %record.branch,
                started_at = %record.started_at,
                "run started before the latest stored run on its branch"
            );
        }

        let new_identities: Vec<String> = outcome
            .entries
            .iter()
            .filter(|e| e.is_new)
            .map(|e| e.identity.id.clone())
            .collect();

        info!(
            run_id = %run_id,
            branch = %record.branch,
            entries = outcome.entries.len(),
            new_tests = new_identities.len(),
            "run accepted"
        );

        // A new row under a known key means another writer retired the test.
        self.classifier.forget(&new_identities);

        let mut transitions = Vec::new();
        for entry in &outcome.entries {
            match self.classifier.recompute(&entry.identity.id).await {
                Ok(Some(event)) => transitions.push(event),
                Ok(None) => {}
                Err(ClassifyError::InsufficientHistory { identity_id }) => {
                    debug!(identity = %identity_id, "nothing to classify yet");
                }
                Err(ClassifyError::Store(e)) => {
                    // The run is committed; state catches up on the next append or rebuild.
                    warn!(identity = %entry.identity.id, error = %e, "reclassification failed");
                }
            }
        }

        Ok(IngestReport {
            run_id,
            run_seq: outcome.run_seq,
            entries: outcome.entries.len(),
            new_identities,
            out_of_order: outcome.out_of_order,
            transitions,
        })
    }
}
