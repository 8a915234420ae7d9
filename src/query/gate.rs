//! Merge gate decisions for a run, derived from current classifications.

use serde::Serialize;

use crate::classify::{Classification, ClassificationState};
use crate::config::GateConfig;
use crate::ingest::TestStatus;
use crate::storage::RunTest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateVerdict {
    Pass,
    Warn,
    Block,
}

impl GateVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateVerdict::Pass => "pass",
            GateVerdict::Warn => "warn",
            GateVerdict::Block => "block",
        }
    }
}

impl std::fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateFinding {
    pub identity_id: String,
    pub title: String,
    /// Status of the test in the gated run.
    pub status: TestStatus,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub run_id: String,
    pub verdict: GateVerdict,
    pub blocking: Vec<GateFinding>,
    pub warnings: Vec<GateFinding>,
    /// Quarantined tests in the run. Listed, never counted.
    pub quarantined: Vec<GateFinding>,
}

/// Decide a run's verdict from the effective classification of each test it
/// reported. Tests without state count as `insufficient_data`.
pub fn evaluate<F>(run_id: &str, tests: &[RunTest], config: &GateConfig, state_of: F) -> GateDecision
where
    F: Fn(&str) -> Option<ClassificationState>,
{
    let mut decision = GateDecision {
        run_id: run_id.to_string(),
        verdict: GateVerdict::Pass,
        blocking: Vec::new(),
        warnings: Vec::new(),
        quarantined: Vec::new(),
    };

    for test in tests {
        let classification = state_of(&test.identity_id)
            .map(|s| s.effective())
            .unwrap_or(Classification::InsufficientData);
        let finding = GateFinding {
            identity_id: test.identity_id.clone(),
            title: test.title.clone(),
            status: test.status,
            classification,
        };

        if classification == Classification::Quarantined {
            decision.quarantined.push(finding);
        } else if config.block_on.contains(&classification) {
            decision.blocking.push(finding);
        } else if config.warn_on.contains(&classification) {
            decision.warnings.push(finding);
        }
    }

    decision.verdict = if !decision.blocking.is_empty() {
        GateVerdict::Block
    } else if !decision.warnings.is_empty() {
        GateVerdict::Warn
    } else {
        GateVerdict::Pass
    };
    decision
}
