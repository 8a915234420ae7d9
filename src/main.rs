use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};

use flakewatch::classify::Classification;
use flakewatch::config::{FlakewatchConfig, LoggingConfig};
use flakewatch::engine::Flakewatch;
use flakewatch::ingest::{IngestError, RunRecord};
use flakewatch::query::{GateVerdict, Scope, TrendMetric};
use flakewatch::storage::{DayRange, HistoryWindow};

#[derive(Parser)]
#[command(
    name = "flakewatch",
    about = "Flaky-test detection and aggregation for CI results",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $FLAKEWATCH_CONFIG, then ./flakewatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + retention loop)
    Serve {
        /// Bind address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Ingest run records from a JSON file ('-' for stdin). The file holds
    /// one record or an array of records.
    Ingest {
        file: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show current classification of every test
    Status {
        /// Only tests with this effective classification
        #[arg(long)]
        classification: Option<Classification>,

        #[arg(long)]
        json: bool,
    },

    /// Show the newest history entries of a test
    History {
        /// Test identity key
        test: String,

        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Flake rate of one test or the whole suite over a day range
    FlakeRate {
        /// Test identity key (default: all tests)
        #[arg(long)]
        test: Option<String>,

        #[command(flatten)]
        range: RangeArgs,

        #[arg(long)]
        json: bool,
    },

    /// Slowest tests by mean duration over a day range
    Slowest {
        #[arg(short, long, default_value = "10")]
        n: usize,

        #[command(flatten)]
        range: RangeArgs,

        #[arg(long)]
        json: bool,
    },

    /// Compare a metric between a day range and a baseline
    Trend {
        /// pass_rate, fail_rate, flake_rate or mean_duration
        #[arg(long)]
        metric: TrendMetric,

        #[arg(long)]
        branch: Option<String>,

        #[command(flatten)]
        range: RangeArgs,

        /// Baseline start (default: the equal-length range before)
        #[arg(long, requires = "baseline_to")]
        baseline_from: Option<NaiveDate>,

        #[arg(long, requires = "baseline_from")]
        baseline_to: Option<NaiveDate>,

        #[arg(long)]
        json: bool,
    },

    /// Merge gate verdict for a run. Exits 2 on block.
    Gate {
        run_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Recent classification transitions
    Transitions {
        #[arg(long)]
        test: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Manage quarantined tests
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },

    /// Apply the retention policy now
    Prune {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// Quarantine a test
    Add {
        test: String,

        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Release a test from quarantine
    Remove { test: String },

    /// List quarantined tests
    List,
}

#[derive(Args)]
struct RangeArgs {
    /// Number of days ending at --to
    #[arg(long, default_value = "7")]
    days: u32,

    /// First day (YYYY-MM-DD), overrides --days
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last day (YYYY-MM-DD), default today (UTC)
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl RangeArgs {
    fn resolve(&self) -> Result<DayRange> {
        let last = self.to.unwrap_or_else(|| Utc::now().date_naive());
        match self.from {
            Some(first) => Ok(DayRange::new(first, last)),
            None => DayRange::ending(last, self.days)
                .with_context(|| format!("--days {} reaches outside the calendar", self.days)),
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_records(file: &Path) -> Result<Vec<RunRecord>> {
    let raw = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?
    };

    let value: serde_json::Value = serde_json::from_str(&raw).context("input is not valid JSON")?;
    let records = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(records)
}

fn fmt_rate(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.1}%", r * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FlakewatchConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting Flakewatch daemon");
            flakewatch::serve(config).await
        }
        command => {
            let app = Flakewatch::open(config).await?;
            run(&app, command).await
        }
    }
}

/// One-shot commands against an opened database.
async fn run(app: &Flakewatch, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { .. } => anyhow::bail!("'serve' is not a one-shot command"),
        Commands::Ingest { file, json } => {
            let mut failed = 0;
            for record in read_records(&file)? {
                match app.ingest(record).await {
                    Ok(report) => {
                        if json {
                            println!("{}", serde_json::to_string(&report)?);
                        } else {
                            println!(
                                "{}: {} results, {} new tests, {} transitions{}",
                                report.run_id,
                                report.entries,
                                report.new_identities.len(),
                                report.transitions.len(),
                                if report.out_of_order { " (out of order)" } else { "" }
                            );
                            for t in &report.transitions {
                                println!("  {} : {} -> {}", t.title, t.from, t.to);
                            }
                        }
                    }
                    Err(IngestError::DuplicateRun { run_id }) => {
                        println!("{}: duplicate, skipped", run_id);
                    }
                    Err(e) => {
                        eprintln!("{}: rejected: {}", e.run_id(), e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} run(s) rejected", failed);
            }
        }
        Commands::Status { classification, json } => {
            let states = app.query().snapshot(classification);
            if json {
                println!("{}", serde_json::to_string_pretty(&states)?);
            } else if states.is_empty() {
                println!("No tests classified yet.");
            } else {
                println!(
                    "{:<22} | {:<10} | {:>7} | {:>6} | {:>6} | Test",
                    "Classification", "Score", "Flaky", "Fail", "Window"
                );
                println!("{:-<22}-|-{:-<10}-|-{:->7}-|-{:->6}-|-{:->6}-|-{:-<30}", "", "", "", "", "", "");
                for s in &states {
                    println!(
                        "{:<22} | {:<10.3} | {:>7} | {:>6} | {:>6} | {}",
                        s.effective(),
                        s.flake_score,
                        fmt_rate(Some(s.flake_rate)),
                        fmt_rate(Some(s.fail_rate)),
                        s.window_size,
                        s.title
                    );
                }
            }
        }
        Commands::History { test, limit, json } => {
            let entries = app.query().history(&test, HistoryWindow::Latest(limit))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No history for '{}'.", test);
            } else {
                println!("{:<24} | {:<8} | {:>8} | {:<20} | Error", "Started", "Status", "Attempts", "Run");
                println!("{:-<24}-|-{:-<8}-|-{:->8}-|-{:-<20}-|-{:-<20}", "", "", "", "", "");
                for e in &entries {
                    println!(
                        "{:<24} | {:<8} | {:>8} | {:<20} | {}",
                        e.started_at.to_rfc3339(),
                        e.status,
                        e.attempts,
                        e.run_id,
                        e.error_signature
                    );
                }
            }
        }
        Commands::FlakeRate { test, range, json } => {
            let scope = test.map_or(Scope::All, Scope::Test);
            let report = app.query().flake_rate(&scope, range.resolve()?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Scope:      {}", report.scope);
                println!("Days:       {} .. {}", report.range.first, report.range.last);
                println!("Executed:   {}", report.executed);
                println!("Flaky:      {} ({})", report.flaky, fmt_rate(report.flake_rate));
                println!("Failed:     {} ({})", report.failed, fmt_rate(report.fail_rate));
            }
        }
        Commands::Slowest { n, range, json } => {
            let rows = app.query().slowest_tests(n, range.resolve()?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No executed tests in range.");
            } else {
                println!("{:>10} | {:>10} | {:>6} | Test", "Mean ms", "Max ms", "Runs");
                println!("{:->10}-|-{:->10}-|-{:->6}-|-{:-<30}", "", "", "", "");
                for r in &rows {
                    println!(
                        "{:>10.1} | {:>10} | {:>6} | {}",
                        r.mean_duration_ms, r.max_duration_ms, r.executed, r.title
                    );
                }
            }
        }
        Commands::Trend {
            metric,
            branch,
            range,
            baseline_from,
            baseline_to,
            json,
        } => {
            let baseline = baseline_from.zip(baseline_to).map(|(f, t)| DayRange::new(f, t));
            let trend = app
                .query()
                .trend_delta(metric, branch.as_deref(), range.resolve()?, baseline)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&trend)?);
            } else {
                let show = |v: Option<f64>| v.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".into());
                println!("Metric:     {}", trend.metric.as_str());
                println!("Current:    {} .. {} = {}", trend.current.first, trend.current.last, show(trend.current_value));
                println!("Baseline:   {} .. {} = {}", trend.baseline.first, trend.baseline.last, show(trend.baseline_value));
                println!("Delta:      {}", show(trend.delta));
            }
        }
        Commands::Gate { run_id, json } => {
            let decision = app
                .query()
                .gate(&run_id)?
                .with_context(|| format!("unknown run '{}'", run_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                println!("Run {}: {}", decision.run_id, decision.verdict.as_str().to_uppercase());
                for f in &decision.blocking {
                    println!("  BLOCK  {} ({})", f.title, f.classification);
                }
                for f in &decision.warnings {
                    println!("  WARN   {} ({})", f.title, f.classification);
                }
                for f in &decision.quarantined {
                    println!("  QUAR   {} ({})", f.title, f.status);
                }
            }
            if decision.verdict == GateVerdict::Block {
                std::process::exit(2);
            }
        }
        Commands::Transitions { test, limit, json } => {
            let events = app.query().transitions(test.as_deref(), limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No transitions recorded.");
            } else {
                for e in &events {
                    println!("{} : {} -> {} (score {:.3}) {}", e.at.to_rfc3339(), e.from, e.to, e.flake_score, e.title);
                }
            }
        }
        Commands::Quarantine { action } => match action {
            QuarantineAction::Add { test, reason } => {
                if app.quarantine(&test, &reason).await? {
                    println!("Test '{}' quarantined.", test);
                } else {
                    anyhow::bail!("unknown test '{}'", test);
                }
            }
            QuarantineAction::Remove { test } => {
                if app.unquarantine(&test).await? {
                    println!("Test '{}' released.", test);
                } else {
                    println!("Test '{}' was not quarantined.", test);
                }
            }
            QuarantineAction::List => {
                let entries = app.quarantined().await?;
                if entries.is_empty() {
                    println!("No quarantined tests.");
                } else {
                    for q in entries {
                        println!("{} : {} ({})", q.identity_id, q.title, q.reason);
                    }
                }
            }
        },
        Commands::Prune { json } => {
            let report = app.prune().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Pruned {} entries and {} rollups older than {} ({} tests retired).",
                    report.entries_deleted,
                    report.rollups_deleted,
                    report.cutoff,
                    report.retired.len()
                );
            }
        }
    }

    Ok(())
}
