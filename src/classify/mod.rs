//! Sliding-window flake classification and transition events.

pub mod engine;
pub mod quarantine;
pub mod transition;
pub mod window;

pub use self::engine::FlakeClassifier;
pub use self::transition::{TransitionEvent, TransitionLog};
pub use self::window::{classify, WindowStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::TestStatus;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("no classifiable history for test '{identity_id}'")]
    InsufficientHistory { identity_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Derived label of a test. Never stored as a fact; always recomputable
/// from the test's history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Fewer entries than the configured minimum.
    InsufficientData,
    /// Neither failed nor needed a retry anywhere in the window.
    Stable,
    /// Failing sometimes without meeting the flaky or failing thresholds.
    Unstable,
    Flaky,
    ConsistentlyFailing,
    /// Operator override; only ever an effective classification.
    Quarantined,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::InsufficientData => "insufficient_data",
            Classification::Stable => "stable",
            Classification::Unstable => "unstable",
            Classification::Flaky => "flaky",
            Classification::ConsistentlyFailing => "consistently_failing",
            Classification::Quarantined => "quarantined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.replace('-', "_").as_str() {
            "insufficient_data" => Some(Classification::InsufficientData),
            "stable" => Some(Classification::Stable),
            "unstable" => Some(Classification::Unstable),
            "flaky" => Some(Classification::Flaky),
            "consistently_failing" => Some(Classification::ConsistentlyFailing),
            "quarantined" => Some(Classification::Quarantined),
            _ => None,
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown classification '{s}'"))
    }
}

/// Current derived state of one test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationState {
    pub identity_id: String,
    pub title: String,
    pub classification: Classification,
    /// Exponentially weighted flake rate, newest entries weigh most.
    pub flake_score: f64,
    pub flake_rate: f64,
    pub fail_rate: f64,
    pub consecutive_fail_streak: usize,
    pub window_size: usize,
    pub mean_duration_ms: f64,
    pub last_status: TestStatus,
    pub last_error_signature: String,
    /// History sequence of the newest entry in the window.
    pub last_seq: i64,
    pub updated_at: DateTime<Utc>,
    pub quarantined: bool,
}

impl ClassificationState {
    /// Classification as seen by the gate and dashboards.
    pub fn effective(&self) -> Classification {
        if self.quarantined {
            Classification::Quarantined
        } else {
            self.classification
        }
    }
}
