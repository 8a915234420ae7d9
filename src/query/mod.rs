//! Read-only aggregation over classification state and daily rollups.

pub mod gate;

pub use self::gate::{GateDecision, GateFinding, GateVerdict};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::classify::{quarantine, Classification, ClassificationState, FlakeClassifier, TransitionEvent};
use crate::config::GateConfig;
use crate::storage::{rollup, DayRange, DurationRow, HistoryEntry, HistoryStore, HistoryWindow, RollupTotals};

/// Which tests a flake-rate query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Test(String),
}

impl Scope {
    fn identity(&self) -> Option<&str> {
        match self {
            Scope::All => None,
            Scope::Test(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlakeRateReport {
    /// Identity key, or `all`.
    pub scope: String,
    pub range: DayRange,
    pub runs: u64,
    pub executed: u64,
    pub flaky: u64,
    pub failed: u64,
    pub retried: u64,
    pub flake_rate: Option<f64>,
    pub fail_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    PassRate,
    FailRate,
    FlakeRate,
    MeanDuration,
}

impl TrendMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendMetric::PassRate => "pass_rate",
            TrendMetric::FailRate => "fail_rate",
            TrendMetric::FlakeRate => "flake_rate",
            TrendMetric::MeanDuration => "mean_duration",
        }
    }

    fn value(&self, totals: &RollupTotals) -> Option<f64> {
        match self {
            TrendMetric::PassRate => totals.pass_rate(),
            TrendMetric::FailRate => totals.fail_rate(),
            TrendMetric::FlakeRate => totals.flake_rate(),
            TrendMetric::MeanDuration => totals.mean_duration_ms(),
        }
    }
}

impl std::str::FromStr for TrendMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "pass_rate" => Ok(TrendMetric::PassRate),
            "fail_rate" => Ok(TrendMetric::FailRate),
            "flake_rate" => Ok(TrendMetric::FlakeRate),
            "mean_duration" | "duration" => Ok(TrendMetric::MeanDuration),
            other => Err(format!("unknown metric '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendDelta {
    pub metric: TrendMetric,
    pub branch: Option<String>,
    pub current: DayRange,
    pub baseline: DayRange,
    pub current_value: Option<f64>,
    pub baseline_value: Option<f64>,
    /// `current_value - baseline_value`; absent unless both are.
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub tests: usize,
    pub by_classification: BTreeMap<Classification, usize>,
}

/// Read path for dashboards and CI gates. Never writes and never scans the
/// full history.
#[derive(Clone)]
pub struct AggregationService {
    store: HistoryStore,
    classifier: Arc<FlakeClassifier>,
    gate: GateConfig,
}

impl AggregationService {
    pub fn new(store: HistoryStore, classifier: Arc<FlakeClassifier>, gate: GateConfig) -> Self {
        Self {
            store,
            classifier,
            gate,
        }
    }

    pub fn flake_rate(&self, scope: &Scope, range: DayRange) -> Result<FlakeRateReport> {
        let conn = self.store.pool().get()?;
        let totals = rollup::totals(&conn, &range, scope.identity(), None)?;
        Ok(FlakeRateReport {
            scope: scope.identity().unwrap_or("all").to_string(),
            range,
            runs: totals.runs,
            executed: totals.executed(),
            flaky: totals.flaky,
            failed: totals.failed,
            retried: totals.retried,
            flake_rate: totals.flake_rate(),
            fail_rate: totals.fail_rate(),
        })
    }

    pub fn slowest_tests(&self, n: usize, range: DayRange) -> Result<Vec<DurationRow>> {
        let conn = self.store.pool().get()?;
        Ok(rollup::slowest(&conn, &range, n)?)
    }

    /// Compare `metric` over `current` with `baseline`, which defaults to the
    /// equal-length range right before `current`.
    pub fn trend_delta(
        &self,
        metric: TrendMetric,
        branch: Option<&str>,
        current: DayRange,
        baseline: Option<DayRange>,
    ) -> Result<TrendDelta> {
        let baseline = match baseline {
            Some(range) => range,
            None => current
                .preceding()
                .context("baseline range falls outside the calendar")?,
        };
        let conn = self.store.pool().get()?;
        let now = rollup::totals(&conn, &current, None, branch)?;
        let before = rollup::totals(&conn, &baseline, None, branch)?;

        let current_value = metric.value(&now);
        let baseline_value = metric.value(&before);
        Ok(TrendDelta {
            metric,
            branch: branch.map(str::to_string),
            current,
            baseline,
            current_value,
            baseline_value,
            delta: current_value.zip(baseline_value).map(|(c, b)| c - b),
        })
    }

    /// Test counts per effective classification.
    pub fn summary(&self) -> Summary {
        let states = self.classifier.snapshot();
        let mut by_classification = BTreeMap::new();
        for state in &states {
            *by_classification.entry(state.effective()).or_insert(0) += 1;
        }
        Summary {
            tests: states.len(),
            by_classification,
        }
    }

    pub fn classification(&self, identity_id: &str) -> Option<ClassificationState> {
        self.classifier.state(identity_id)
    }

    /// States, highest flake score first, optionally only one effective class.
    pub fn snapshot(&self, only: Option<Classification>) -> Vec<ClassificationState> {
        self.classifier
            .snapshot()
            .into_iter()
            .filter(|s| only.map_or(true, |c| s.effective() == c))
            .collect()
    }

    pub fn history(&self, identity_id: &str, window: HistoryWindow) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.query(identity_id, window)?)
    }

    pub fn transitions(&self, identity_id: Option<&str>, limit: usize) -> Result<Vec<TransitionEvent>> {
        Ok(self.classifier.transitions().list_recent(identity_id, limit)?)
    }

    /// Gate decision for a stored run, or `None` if the run is unknown.
    pub fn gate(&self, run_id: &str) -> Result<Option<GateDecision>> {
        let Some(tests) = self.store.run_tests(run_id)? else {
            return Ok(None);
        };
        // Quarantine is read from the store so changes made by other
        // processes apply without waiting for a recompute.
        let quarantined: HashSet<String> = quarantine::list(self.store.pool())?
            .into_iter()
            .map(|q| q.identity_id)
            .collect();
        Ok(Some(gate::evaluate(run_id, &tests, &self.gate, |id| {
            self.classifier.state(id).map(|mut state| {
                state.quarantined = quarantined.contains(id);
                state
            })
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::identity::IdentityResolver;
    use crate::ingest::{Attempt, Ingestor, RunRecord, TestResult, TestStatus};
    use crate::storage::open_pool;
    use chrono::{NaiveDate, TimeZone, Utc};

    struct Fixture {
        _dir: tempfile::TempDir,
        ingestor: Ingestor,
        query: AggregationService,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(open_pool(&dir.path().join("query.db")).unwrap());
        let resolver = Arc::new(IdentityResolver::new());
        let classifier = Arc::new(FlakeClassifier::new(store.clone(), ClassifierConfig::default()));
        Fixture {
            _dir: dir,
            ingestor: Ingestor::new(store.clone(), resolver, Arc::clone(&classifier)),
            query: AggregationService::new(store, classifier, GateConfig::default()),
        }
    }

    /// `(title, attempts, duration)`; the last attempt is the final status.
    fn record(run_id: &str, day: u32, results: &[(&str, &[TestStatus], u64)]) -> RunRecord {
        RunRecord {
            run_id: run_id.into(),
            commit: String::new(),
            branch: "main".into(),
            started_at: Utc.with_ymd_and_hms(2026, 10, day, 8, 0, 0).unwrap(),
            environment: Default::default(),
            results: results
                .iter()
                .map(|(title, attempts, duration)| TestResult {
                    title_path: vec![(*title).into()],
                    file: String::new(),
                    status: *attempts.last().unwrap(),
                    attempts: attempts
                        .iter()
                        .map(|s| Attempt { status: *s, duration_ms: *duration })
                        .collect(),
                    duration_ms: *duration,
                    error: None,
                })
                .collect(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    use TestStatus::{Failed as F, Passed as P};

    #[tokio::test]
    async fn test_flake_rate_all_and_unknown() {
        let fx = fixture();
        fx.ingestor
            .ingest(record("r1", 1, &[("a", &[F, P], 10), ("b", &[P], 10)]))
            .await
            .unwrap();
        fx.ingestor
            .ingest(record("r2", 2, &[("a", &[P], 10), ("b", &[F], 10)]))
            .await
            .unwrap();

        let all = fx.query.flake_rate(&Scope::All, DayRange::new(day(1), day(2))).unwrap();
        assert_eq!(all.executed, 4);
        assert_eq!(all.flaky, 1);
        assert_eq!(all.failed, 1);
        assert_eq!(all.flake_rate, Some(0.25));

        let unknown = fx
            .query
            .flake_rate(&Scope::Test("missing".into()), DayRange::new(day(1), day(2)))
            .unwrap();
        assert_eq!(unknown.runs, 0);
        assert_eq!(unknown.flake_rate, None);

        let empty = fx.query.flake_rate(&Scope::All, DayRange::new(day(20), day(21))).unwrap();
        assert_eq!(empty.executed, 0);
    }

    #[tokio::test]
    async fn test_slowest_ranks_by_mean() {
        let fx = fixture();
        fx.ingestor
            .ingest(record("r1", 1, &[("fast", &[P], 10), ("slow", &[P], 900), ("mid", &[P], 300)]))
            .await
            .unwrap();

        let top = fx.query.slowest_tests(2, DayRange::new(day(1), day(1))).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].title, "slow");
        assert_eq!(top[1].title, "mid");
        assert!(fx.query.slowest_tests(5, DayRange::new(day(9), day(9))).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trend_delta_against_preceding_range() {
        let fx = fixture();
        fx.ingestor.ingest(record("r1", 1, &[("a", &[F], 10)])).await.unwrap();
        fx.ingestor.ingest(record("r2", 2, &[("a", &[P], 10)])).await.unwrap();
        fx.ingestor.ingest(record("r3", 3, &[("a", &[P], 10)])).await.unwrap();
        fx.ingestor.ingest(record("r4", 4, &[("a", &[P], 10)])).await.unwrap();

        let trend = fx
            .query
            .trend_delta(TrendMetric::PassRate, Some("main"), DayRange::new(day(3), day(4)), None)
            .unwrap();
        assert_eq!(trend.baseline, DayRange::new(day(1), day(2)));
        assert_eq!(trend.current_value, Some(1.0));
        assert_eq!(trend.baseline_value, Some(0.5));
        assert_eq!(trend.delta, Some(0.5));

        let other_branch = fx
            .query
            .trend_delta(TrendMetric::PassRate, Some("release"), DayRange::new(day(3), day(4)), None)
            .unwrap();
        assert_eq!(other_branch.delta, None);
    }

    #[tokio::test]
    async fn test_gate_and_summary() {
        let fx = fixture();
        for d in 1..=5 {
            fx.ingestor
                .ingest(record(&format!("r{d}"), d, &[("broken", &[F], 10), ("fine", &[P], 10)]))
                .await
                .unwrap();
        }

        let decision = fx.query.gate("r5").unwrap().unwrap();
        assert_eq!(decision.verdict, GateVerdict::Block);
        assert_eq!(decision.blocking[0].title, "broken");
        assert!(fx.query.gate("nope").unwrap().is_none());

        let summary = fx.query.summary();
        assert_eq!(summary.tests, 2);
        assert_eq!(summary.by_classification[&Classification::ConsistentlyFailing], 1);
        assert_eq!(summary.by_classification[&Classification::Stable], 1);
        assert_eq!(fx.query.snapshot(Some(Classification::Stable)).len(), 1);
    }

    #[tokio::test]
    async fn test_gate_reads_quarantine_from_store() {
        let fx = fixture();
        for d in 1..=5 {
            fx.ingestor
                .ingest(record(&format!("r{d}"), d, &[("broken", &[F], 10)]))
                .await
                .unwrap();
        }
        let id = fx.query.snapshot(None)[0].identity_id.clone();

        // Written straight to the database, as another process would.
        assert!(quarantine::add(fx.query.store.pool(), &id, "ticket 42").unwrap());
        let decision = fx.query.gate("r5").unwrap().unwrap();
        assert_eq!(decision.verdict, GateVerdict::Pass);
        assert_eq!(decision.quarantined.len(), 1);

        assert!(quarantine::remove(fx.query.store.pool(), &id).unwrap());
        let decision = fx.query.gate("r5").unwrap().unwrap();
        assert_eq!(decision.verdict, GateVerdict::Block);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("flake-rate".parse::<TrendMetric>(), Ok(TrendMetric::FlakeRate));
        assert_eq!("duration".parse::<TrendMetric>(), Ok(TrendMetric::MeanDuration));
        assert!("p99".parse::<TrendMetric>().is_err());
    }
}
