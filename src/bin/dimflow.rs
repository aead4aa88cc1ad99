//! Dimflow CLI
//!
//! Thin driver over the library: loads JSONL batches into the engine and
//! inspects the committed stores.
//!
//! Usage:
//!   cargo run --release --bin dimflow -- run --stream customers --snapshots snaps.jsonl --events txns.jsonl
//!   cargo run --release --bin dimflow -- validate
//!   cargo run --release --bin dimflow -- current --key C1
//!   cargo run --release --bin dimflow -- as-of --key C1 --ts 1700000000000
//!   cargo run --release --bin dimflow -- watermarks

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use dimflow::scd::metrics::register_metrics;
use dimflow::scd::types::timestamp_to_datetime;
use dimflow::scd::{DimensionVersion, RawEntitySnapshot, RawEventRecord};
use dimflow::{EngineConfig, PipelineDriver};

/// Versioned dimension and fact loader
#[derive(Parser, Debug)]
#[command(name = "dimflow")]
#[command(about = "Load SCD Type 2 dimensions and point-in-time facts")]
struct Cli {
    /// TOML config file (defaults to dimflow.toml if present)
    #[arg(short, long, env = "DIMFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one batch from JSONL files
    Run {
        /// Source stream name (watermark namespace)
        #[arg(short, long, default_value = "customers")]
        stream: String,

        /// JSONL file of entity snapshots
        #[arg(long)]
        snapshots: Option<PathBuf>,

        /// JSONL file of event records
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// Re-run the invariant validator; clears a halt on a clean pass
    Validate,

    /// Show current versions
    Current {
        /// Single business key (otherwise all)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Show the version valid at a timestamp (ms)
    AsOf {
        #[arg(short, long)]
        key: String,

        #[arg(short, long)]
        ts: i64,
    },

    /// List watermark cursors
    Watermarks,

    /// List unresolvable facts, or move one back to the retry queue
    Unresolvable {
        #[arg(long)]
        requeue: Option<String>,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("dimflow=info".parse()?),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            let mut c = EngineConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            c.apply_env();
            c
        }
        None => EngineConfig::from_env(),
    };
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }

    register_metrics();
    let driver = PipelineDriver::open(config).context("Failed to open pipeline")?;
    if let Some(reason) = driver.halt_reason() {
        warn!("pipeline is halted: {}", reason);
    }

    match cli.command {
        Commands::Run {
            stream,
            snapshots,
            events,
        } => run(&driver, &stream, snapshots.as_deref(), events.as_deref())?,
        Commands::Validate => validate(&driver)?,
        Commands::Current { key } => show_current(&driver, key.as_deref()),
        Commands::AsOf { key, ts } => show_as_of(&driver, &key, ts),
        Commands::Watermarks => show_watermarks(&driver)?,
        Commands::Unresolvable { requeue } => unresolvable(&driver, requeue.as_deref())?,
    }

    Ok(())
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), n + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn run(
    driver: &PipelineDriver,
    stream: &str,
    snapshots: Option<&Path>,
    events: Option<&Path>,
) -> Result<()> {
    let snapshots: Vec<RawEntitySnapshot> = match snapshots {
        Some(p) => read_jsonl(p)?,
        None => Vec::new(),
    };
    let events: Vec<RawEventRecord> = match events {
        Some(p) => read_jsonl(p)?,
        None => Vec::new(),
    };
    info!(snapshots = snapshots.len(), events = events.len(), "input loaded");

    let report = driver.run_batch(stream, snapshots, events)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed() {
        bail!("batch {} failed validation; watermarks held", report.batch_id);
    }
    Ok(())
}

fn validate(driver: &PipelineDriver) -> Result<()> {
    let report = driver.resume_after_investigation();
    println!("{}", report.summary());
    for v in &report.violations {
        println!("  [{:?}] {}", v.category(), v);
    }
    for s in &report.stale_bindings {
        println!(
            "  [advisory] {} at {} outside {} of {}",
            s.fact_key, s.event_ts, s.interval, s.surrogate_key
        );
    }
    if !report.passed() {
        bail!("{} invariant violations", report.violations.len());
    }
    Ok(())
}

fn print_version(v: &DimensionVersion) {
    let fmt_ts = |ts: i64| {
        timestamp_to_datetime(ts)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "open".to_string())
    };
    println!(
        "{:<16} {:>10} {:>26} {:>26} {:>7}  {}",
        v.business_key,
        v.surrogate_key,
        fmt_ts(v.valid_from),
        fmt_ts(v.valid_to),
        v.is_current,
        serde_json::Value::Object(v.attributes.clone().into_iter().collect())
    );
}

fn print_header() {
    println!(
        "{:<16} {:>10} {:>26} {:>26} {:>7}  {}",
        "Key", "SK", "Valid From", "Valid To", "Current", "Attributes"
    );
    println!("{}", "-".repeat(110));
}

fn show_current(driver: &PipelineDriver, key: Option<&str>) {
    print_header();
    match key {
        Some(k) => match driver.dimensions().current(k) {
            Some(v) => print_version(&v),
            None => println!("{}: no current version", k),
        },
        None => {
            for v in driver.dimensions().current_versions() {
                print_version(&v);
            }
        }
    }
}

fn show_as_of(driver: &PipelineDriver, key: &str, ts: i64) {
    print_header();
    match driver.dimensions().as_of(key, ts) {
        Some(v) => print_version(&v),
        None => println!("{}: no version valid at {}", key, ts),
    }
}

fn show_watermarks(driver: &PipelineDriver) -> Result<()> {
    if let Some(storage) = driver.storage() {
        println!("Database: {} ({} batches logged)", storage.path(), storage.batch_count()?);
    }
    println!("{:<32} {:>20} {:>26}", "Cursor", "Position", "Updated");
    println!("{}", "-".repeat(80));
    for w in driver.watermarks().all() {
        let updated = timestamp_to_datetime(w.updated_at)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        println!("{:<32} {:>20} {:>26}", w.cursor, w.position, updated);
    }
    Ok(())
}

fn unresolvable(driver: &PipelineDriver, requeue: Option<&str>) -> Result<()> {
    if let Some(event_key) = requeue {
        if driver.requeue_unresolvable(event_key)? {
            println!("{} moved back to the deferred queue", event_key);
        } else {
            bail!("{} is not an unresolvable fact", event_key);
        }
        return Ok(());
    }
    for u in driver.binder().unresolvable() {
        println!("{:<24} attempts={} {}", u.event_key, u.attempts, u.reason);
    }
    Ok(())
}
