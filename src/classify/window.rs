//! Pure statistics over a classification window.

use serde::Serialize;

use crate::classify::{Classification, ClassifyError};
use crate::config::ClassifierConfig;
use crate::ingest::TestStatus;
use crate::storage::HistoryEntry;

/// Tolerance for rate-versus-threshold comparisons, so that e.g. 2/20
/// meets a 0.10 threshold regardless of float rounding.
const RATE_EPSILON: f64 = 1e-9;

/// Statistics of one window of history entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub size: usize,
    /// Entries that failed or needed a retry.
    pub failed_or_retried: usize,
    /// Entries that needed a retry and then passed.
    pub passed_after_retry: usize,
    pub fail_rate: f64,
    pub flake_rate: f64,
    pub consecutive_fail_streak: usize,
    pub flake_score: f64,
    pub mean_duration_ms: f64,
}

impl WindowStats {
    /// Compute statistics over `window`, ordered newest first. Skipped
    /// entries carry no signal and are ignored.
    pub fn compute(
        identity_id: &str,
        window: &[HistoryEntry],
        score_decay: f64,
    ) -> Result<Self, ClassifyError> {
        let entries: Vec<&HistoryEntry> = window
            .iter()
            .filter(|e| e.status != TestStatus::Skipped)
            .collect();
        if entries.is_empty() {
            return Err(ClassifyError::InsufficientHistory {
                identity_id: identity_id.to_string(),
            });
        }

        let size = entries.len();
        let failed_or_retried = entries
            .iter()
            .filter(|e| e.status == TestStatus::Failed || e.was_retried)
            .count();
        let passed_after_retry = entries.iter().filter(|e| e.passed_after_retry()).count();
        let consecutive_fail_streak = entries
            .iter()
            .take_while(|e| e.status == TestStatus::Failed)
            .count();

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        let mut weight = 1.0;
        for entry in &entries {
            if entry.passed_after_retry() {
                weighted += weight;
            }
            total_weight += weight;
            weight *= score_decay;
        }

        let duration_sum: u64 = entries.iter().map(|e| e.duration_ms).sum();

        Ok(Self {
            size,
            failed_or_retried,
            passed_after_retry,
            fail_rate: failed_or_retried as f64 / size as f64,
            flake_rate: passed_after_retry as f64 / size as f64,
            consecutive_fail_streak,
            flake_score: weighted / total_weight,
            mean_duration_ms: duration_sum as f64 / size as f64,
        })
    }
}

/// Apply the classification rules, first match wins:
/// too little data, failing streak, flake rate, clean window, otherwise unstable.
pub fn classify(stats: &WindowStats, config: &ClassifierConfig) -> Classification {
    if stats.size < config.min_history {
        return Classification::InsufficientData;
    }
    if stats.consecutive_fail_streak >= config.failing_streak {
        return Classification::ConsistentlyFailing;
    }
    if stats.flake_rate + RATE_EPSILON >= config.flaky_threshold {
        return Classification::Flaky;
    }
    if stats.failed_or_retried == 0 && stats.passed_after_retry == 0 {
        return Classification::Stable;
    }
    Classification::Unstable
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[derive(Clone, Copy)]
    enum Outcome {
        Pass,
        Fail,
        RetriedPass,
        RetriedFail,
        Skip,
    }
    use Outcome::*;

    /// Build a window from outcomes listed oldest first.
    fn window(outcomes: &[Outcome]) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| {
                let (status, was_retried) = match o {
                    Pass => (TestStatus::Passed, false),
                    Fail => (TestStatus::Failed, false),
                    RetriedPass => (TestStatus::Passed, true),
                    RetriedFail => (TestStatus::Failed, true),
                    Skip => (TestStatus::Skipped, false),
                };
                HistoryEntry {
                    seq: i as i64 + 1,
                    identity_id: "id".into(),
                    run_id: format!("run-{i}"),
                    branch: "main".into(),
                    commit: String::new(),
                    status,
                    was_retried,
                    attempts: if was_retried { 2 } else { 1 },
                    duration_ms: 100,
                    error_signature: String::new(),
                    file: String::new(),
                    started_at: Utc::now(),
                }
            })
            .collect();
        entries.reverse();
        entries
    }

    fn run(outcomes: &[Outcome]) -> Classification {
        let config = ClassifierConfig::default();
        let stats = WindowStats::compute("id", &window(outcomes), config.score_decay).unwrap();
        classify(&stats, &config)
    }

    #[test]
    fn test_empty_window_is_insufficient_history() {
        let err = WindowStats::compute("id", &[], 0.85).unwrap_err();
        assert!(matches!(err, ClassifyError::InsufficientHistory { .. }));

        let only_skips = window(&[Skip, Skip]);
        assert!(WindowStats::compute("id", &only_skips, 0.85).is_err());
    }

    #[test]
    fn test_fewer_than_min_history_is_insufficient_data() {
        assert_eq!(run(&[Fail, Fail, Fail, Fail]), Classification::InsufficientData);
        assert_eq!(run(&[Pass]), Classification::InsufficientData);
    }

    #[test]
    fn test_login_flow_scenario_is_flaky() {
        // pass, pass, fail-then-pass, pass, fail-then-pass
        let outcomes = [Pass, Pass, RetriedPass, Pass, RetriedPass];
        let stats = WindowStats::compute("id", &window(&outcomes), 0.85).unwrap();
        assert_eq!(stats.size, 5);
        assert!((stats.flake_rate - 0.40).abs() < 1e-12);
        assert_eq!(run(&outcomes), Classification::Flaky);
    }

    #[test]
    fn test_trailing_failures_win_over_flake_rate() {
        let outcomes = [RetriedPass, RetriedPass, Pass, Fail, Fail, Fail];
        assert_eq!(run(&outcomes), Classification::ConsistentlyFailing);
    }

    #[test]
    fn test_streak_stops_at_first_pass() {
        let outcomes = [Pass, Pass, Fail, Fail, Pass, Fail, Fail];
        let stats = WindowStats::compute("id", &window(&outcomes), 0.85).unwrap();
        assert_eq!(stats.consecutive_fail_streak, 2);
        assert_eq!(run(&outcomes), Classification::Unstable);
    }

    #[test]
    fn test_threshold_boundary_two_of_twenty() {
        let mut outcomes = vec![Pass; 18];
        outcomes.insert(3, RetriedPass);
        outcomes.insert(11, RetriedPass);
        assert_eq!(outcomes.len(), 20);
        assert_eq!(run(&outcomes), Classification::Flaky);
    }

    #[test]
    fn test_threshold_boundary_one_of_twenty() {
        let mut outcomes = vec![Pass; 19];
        outcomes.insert(7, RetriedPass);
        let stats = WindowStats::compute("id", &window(&outcomes), 0.85).unwrap();
        assert!((stats.flake_rate - 0.05).abs() < 1e-12);
        assert_eq!(run(&outcomes), Classification::Unstable);
    }

    #[test]
    fn test_clean_window_is_stable() {
        assert_eq!(run(&[Pass; 8]), Classification::Stable);
    }

    #[test]
    fn test_retried_failure_counts_toward_fail_rate() {
        let outcomes = [Pass, Pass, Pass, Pass, RetriedFail, Pass];
        let stats = WindowStats::compute("id", &window(&outcomes), 0.85).unwrap();
        assert_eq!(stats.failed_or_retried, 1);
        assert_eq!(stats.passed_after_retry, 0);
        assert_eq!(run(&outcomes), Classification::Unstable);
    }

    #[test]
    fn test_skips_are_ignored() {
        let outcomes = [Pass, Skip, Pass, Skip, Pass, Pass, Pass];
        let stats = WindowStats::compute("id", &window(&outcomes), 0.85).unwrap();
        assert_eq!(stats.size, 5);
        assert_eq!(run(&outcomes), Classification::Stable);
    }

    #[test]
    fn test_flake_score_weighs_recent_entries_more() {
        let recent = WindowStats::compute("id", &window(&[Pass, Pass, Pass, Pass, RetriedPass]), 0.5).unwrap();
        let old = WindowStats::compute("id", &window(&[RetriedPass, Pass, Pass, Pass, Pass]), 0.5).unwrap();
        assert_eq!(recent.flake_rate, old.flake_rate);
        assert!(recent.flake_score > old.flake_score);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let w = window(&[Pass, RetriedPass, Fail, Pass, Pass, RetriedPass, Pass]);
        let config = ClassifierConfig::default();
        let first = WindowStats::compute("id", &w, config.score_decay).unwrap();
        for _ in 0..10 {
            let again = WindowStats::compute("id", &w, config.score_decay).unwrap();
            assert_eq!(again, first);
            assert_eq!(classify(&again, &config), classify(&first, &config));
        }
    }
}
