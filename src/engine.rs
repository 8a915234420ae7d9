//! Wiring of store, resolver, classifier, ingestor and query service, plus
//! the background retention loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::classify::quarantine::{self, QuarantineEntry};
use crate::classify::FlakeClassifier;
use crate::config::FlakewatchConfig;
use crate::identity::IdentityResolver;
use crate::ingest::{IngestError, IngestReport, Ingestor, RunRecord};
use crate::query::AggregationService;
use crate::storage::{open_pool, HistoryStore, PruneReport, RetentionPolicy};

pub struct Flakewatch {
    config: FlakewatchConfig,
    store: HistoryStore,
    resolver: Arc<IdentityResolver>,
    classifier: Arc<FlakeClassifier>,
    ingestor: Ingestor,
    query: AggregationService,
}

impl Flakewatch {
    /// Open the database and rebuild classification state from history.
    pub async fn open(config: FlakewatchConfig) -> Result<Self> {
        config.classifier.validate()?;

        let db_path = config.storage.db_path.clone();
        info!(db_path = %db_path.display(), "opening database");
        let pool = tokio::task::spawn_blocking(move || open_pool(&db_path))
            .await
            .context("database open task failed")??;

        let store = HistoryStore::new(pool);
        let resolver = Arc::new(IdentityResolver::new());
        let classifier = Arc::new(FlakeClassifier::new(store.clone(), config.classifier.clone()));
        classifier
            .rebuild()
            .await
            .context("failed to rebuild classification state")?;

        let ingestor = Ingestor::new(store.clone(), Arc::clone(&resolver), Arc::clone(&classifier));
        let query = AggregationService::new(store.clone(), Arc::clone(&classifier), config.gate.clone());

        Ok(Self {
            config,
            store,
            resolver,
            classifier,
            ingestor,
            query,
        })
    }

    pub fn config(&self) -> &FlakewatchConfig {
        &self.config
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn classifier(&self) -> &Arc<FlakeClassifier> {
        &self.classifier
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn query(&self) -> &AggregationService {
        &self.query
    }

    pub async fn ingest(&self, record: RunRecord) -> Result<IngestReport, IngestError> {
        self.ingestor.ingest(record).await
    }

    /// Apply the configured retention policy and drop retired tests from
    /// memory.
    pub async fn prune(&self) -> Result<PruneReport> {
        let policy = RetentionPolicy::from_config(&self.config.retention);
        let window = self.config.classifier.window_size;
        let store = self.store.clone();
        let report = tokio::task::spawn_blocking(move || store.prune(&policy, Utc::now(), window))
            .await
            .context("prune task failed")??;

        if !report.retired.is_empty() {
            self.resolver.forget(&report.retired);
            self.classifier.forget(&report.retired);
            for id in &report.retired {
                info!(identity = %id, "test retired");
            }
        }
        Ok(report)
    }

    /// Returns `false` if the test is unknown.
    pub async fn quarantine(&self, identity_id: &str, reason: &str) -> Result<bool> {
        let pool = self.store.pool().clone();
        let (id, why) = (identity_id.to_string(), reason.to_string());
        let added = tokio::task::spawn_blocking(move || quarantine::add(&pool, &id, &why))
            .await
            .context("quarantine task failed")??;
        if added {
            self.classifier.set_quarantined(identity_id, true);
            info!(identity = %identity_id, reason = %reason, "test quarantined");
        }
        Ok(added)
    }

    /// Returns `false` if the test was not quarantined.
    pub async fn unquarantine(&self, identity_id: &str) -> Result<bool> {
        let pool = self.store.pool().clone();
        let id = identity_id.to_string();
        let removed = tokio::task::spawn_blocking(move || quarantine::remove(&pool, &id))
            .await
            .context("quarantine task failed")??;
        if removed {
            self.classifier.set_quarantined(identity_id, false);
            info!(identity = %identity_id, "test released from quarantine");
        }
        Ok(removed)
    }

    pub async fn quarantined(&self) -> Result<Vec<QuarantineEntry>> {
        let pool = self.store.pool().clone();
        let entries = tokio::task::spawn_blocking(move || quarantine::list(&pool))
            .await
            .context("quarantine task failed")??;
        Ok(entries)
    }
}

/// Periodically prune history until `cancel` fires.
pub async fn run_retention_loop(app: Arc<Flakewatch>, cancel: CancellationToken) {
    let secs = app.config().retention.interval_secs;
    if secs == 0 {
        info!("retention loop disabled");
        return;
    }
    info!(interval_secs = secs, "retention loop started");

    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    // First tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("retention loop stopped");
                return;
            }
            _ = interval.tick() => {
                if let Err(e) = app.prune().await {
                    error!("scheduled prune failed: {:#}", e);
                }
            }
        }
    }
}
