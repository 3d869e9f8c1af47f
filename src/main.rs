//! CLI entry point for the ridership rollup tool.
//!
//! Provides subcommands for rider-type usage shares, return-to-baseline
//! proportions, time-block combination sweeps, and dataset checks.

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use ridership_rollup::analyzers::analyzer::{
    label, prepare, ridership_return, summarize_return, summarize_usage, time_groups, usage_share,
};
use ridership_rollup::analyzers::calendar::{BusinessCalendar, LabeledRecord};
use ridership_rollup::analyzers::quality::run_checks;
use ridership_rollup::analyzers::types::Table;
use ridership_rollup::config::RollupConfig;
use ridership_rollup::output::{print_json, write_csv, write_csv_gz};
use ridership_rollup::parser::{parse_records, parse_table, read_input};
use std::ffi::OsStr;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "ridership_rollup")]
#[command(about = "Roll up transit ridership by period, peer group and rider type", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Common {
    /// Records CSV (optionally .gz)
    #[arg(short, long)]
    input: String,

    /// JSON config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// CSV file to write the result table to
    #[arg(short, long)]
    output: Option<String>,

    /// Gzip the output CSV
    #[arg(long, default_value_t = false)]
    gzip: bool,

    /// Write full-precision numbers instead of display-rounded ones
    #[arg(long, default_value_t = false)]
    raw: bool,

    /// Log the result table as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log narrative summary facts
    #[arg(long, default_value_t = false)]
    summary: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Share of each rider type within its group
    Usage {
        #[command(flatten)]
        common: Common,
    },
    /// Mean daily ridership as a proportion of the baseline window
    Return {
        #[command(flatten)]
        common: Common,

        /// Separate records CSV for the baseline window
        #[arg(short, long)]
        baseline: Option<String>,
    },
    /// Return proportions for every partial combination of time blocks
    TimeGroups {
        #[command(flatten)]
        common: Common,

        /// Separate records CSV for the baseline window
        #[arg(short, long)]
        baseline: Option<String>,
    },
    /// Run dataset checks on a CSV
    Check {
        /// CSV file to check
        #[arg(short, long)]
        input: String,

        /// JSON config file with a `quality` section
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/ridership_rollup.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("ridership_rollup.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug")),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Usage { common } => {
            let config = load_config(common.config.as_deref())?;
            let calendar = calendar();
            let records = load_labeled(&common.input, &config, &calendar)?;

            let table = usage_share(&records, &config)?;
            if common.summary {
                print_json(&summarize_usage(&table, &config)?)?;
            }
            emit(&table, &common)?;
        }
        Commands::Return { common, baseline } => {
            let config = load_config(common.config.as_deref())?;
            let calendar = calendar();
            let (current, base) = load_with_baseline(&common, baseline.as_deref(), &config, &calendar)?;

            let table = ridership_return(&current, &base, &config, &calendar)?;
            if common.summary {
                print_json(&summarize_return(&table, &config)?)?;
            }
            emit(&table, &common)?;
        }
        Commands::TimeGroups { common, baseline } => {
            let config = load_config(common.config.as_deref())?;
            let calendar = calendar();
            let (current, base) = load_with_baseline(&common, baseline.as_deref(), &config, &calendar)?;

            let table = time_groups(&current, &base, &config, &calendar)?;
            emit(&table, &common)?;
        }
        Commands::Check { input, config } => {
            let config = load_config(config.as_deref())?;
            let table = parse_table(&read_input(&input)?)?;

            let report = run_checks(&table, &config.quality)?;
            print_json(&report)?;
            if report.is_clean() {
                info!(input, "All checks passed");
            } else {
                warn!(
                    input,
                    findings = report.findings.len(),
                    "Dataset checks found problems"
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<RollupConfig> {
    match path {
        Some(p) => {
            info!(path = p, "Loading config");
            RollupConfig::load(p)
        }
        None => Ok(RollupConfig::default()),
    }
}

/// Business days from 2019 through the holiday horizon past today.
fn calendar() -> BusinessCalendar {
    BusinessCalendar::through_horizon(Utc::now().date_naive())
}

#[tracing::instrument(skip(config, calendar))]
fn load_labeled(
    path: &str,
    config: &RollupConfig,
    calendar: &BusinessCalendar,
) -> Result<Vec<LabeledRecord>> {
    let records = parse_records(&read_input(path)?)?;
    let records = prepare(&records, config)?;
    let labeled = label(&records, calendar, config)?;
    info!(records = records.len(), kept = labeled.len(), "Records loaded");
    Ok(labeled)
}

/// Current and baseline records. Without a separate baseline file both come
/// from the input, and the current side starts after the baseline window.
fn load_with_baseline(
    common: &Common,
    baseline: Option<&str>,
    config: &RollupConfig,
    calendar: &BusinessCalendar,
) -> Result<(Vec<LabeledRecord>, Vec<LabeledRecord>)> {
    let current = load_labeled(&common.input, config, calendar)?;
    match baseline {
        Some(path) => Ok((current, load_labeled(path, config, calendar)?)),
        None => {
            let later = current
                .iter()
                .filter(|r| r.record.date >= config.baseline_window.end)
                .cloned()
                .collect();
            Ok((later, current))
        }
    }
}

fn emit(table: &Table, common: &Common) -> Result<()> {
    if common.json {
        print_json(table)?;
    }

    match &common.output {
        Some(path) if common.gzip => write_csv_gz(path, table, !common.raw)?,
        Some(path) => write_csv(path, table, !common.raw)?,
        None if !common.json => print_json(table)?,
        None => {}
    }
    Ok(())
}
