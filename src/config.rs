//! TOML configuration for flakewatch.
//!
//! A layered model: compiled-in defaults, overridden by a TOML file found via
//! `--config`, the `FLAKEWATCH_CONFIG` environment variable, or
//! `./flakewatch.toml`, in that order.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::Classification;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the engine and its server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlakewatchConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlakewatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .classifier
            .validate()
            .with_context(|| format!("invalid [classifier] section in {}", path.display()))?;
        info!(path = %path.display(), "loaded flakewatch configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (the `--config` flag). Failing to load it is an error.
    /// 2. The path in the `FLAKEWATCH_CONFIG` environment variable.
    /// 3. `./flakewatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("FLAKEWATCH_CONFIG") {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FLAKEWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new("flakewatch.toml");
        if local.exists() {
            return Self::load(local);
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/flakewatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Thresholds for the sliding-window flake classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Number of most recent (non-skipped) history entries considered.
    pub window_size: usize,
    /// Below this many entries a test is reported as `insufficient_data`.
    pub min_history: usize,
    /// Flake rate at or above which a test is `flaky`.
    pub flaky_threshold: f64,
    /// Trailing failures at or above which a test is `consistently_failing`.
    pub failing_streak: usize,
    /// Per-entry decay of the exponentially weighted flake score.
    pub score_decay: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_history: 5,
            flaky_threshold: 0.10,
            failing_streak: 3,
            score_decay: 0.85,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            bail!("window_size must be at least 1");
        }
        if self.min_history > self.window_size {
            bail!(
                "min_history ({}) cannot exceed window_size ({})",
                self.min_history,
                self.window_size
            );
        }
        if !(self.flaky_threshold > 0.0 && self.flaky_threshold <= 1.0) {
            bail!("flaky_threshold must be in (0, 1], got {}", self.flaky_threshold);
        }
        if self.failing_streak == 0 {
            bail!("failing_streak must be at least 1");
        }
        if !(self.score_decay > 0.0 && self.score_decay <= 1.0) {
            bail!("score_decay must be in (0, 1], got {}", self.score_decay);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// History entries and rollups older than this are eligible for pruning.
    pub max_age_days: u32,
    /// Newest classifiable entries always kept per test. Clamped up to the
    /// classifier window size.
    pub keep_latest: usize,
    /// Retire a test after this many consecutive runs without it. 0 disables.
    pub retire_after_absent_runs: u32,
    /// Period of the background retention task in `serve`.
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: 90,
            keep_latest: 20,
            retire_after_absent_runs: 50,
            interval_secs: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// CI gate
// ---------------------------------------------------------------------------

/// Which classifications block or warn a merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub block_on: Vec<Classification>,
    pub warn_on: Vec<Classification>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            block_on: vec![Classification::ConsistentlyFailing],
            warn_on: vec![Classification::Flaky, Classification::Unstable],
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
