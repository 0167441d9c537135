//! # trail
//!
//! Command-line host for the telemetry pipeline: feeds service events from
//! stdin into the durable queues and delivers them to the collector.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use trail_core::platform::{ManualReachability, SystemClock};
use trail_engine::{Runtime, RuntimeDeps, ServiceEvent};
use trail_net::HttpTransport;
use trail_settings::TrailSettings;
use trail_store::Database;
use trail_telemetry::TelemetryConfig;

/// On-device telemetry pipeline.
#[derive(Parser, Debug)]
#[command(name = "trail", about = "Queue and deliver location telemetry")]
struct Cli {
    /// Settings file (defaults to `~/.trail/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Database file (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read newline-delimited service events from stdin, queue them, and let
    /// the scheduler deliver them. Flushes once more at end of input.
    Run,
    /// Deliver everything queued now.
    Flush,
    /// Print queue depth, auth state, and sync counters as JSON.
    Status,
    /// Delete every queued event.
    Purge,
}

fn load_settings(path: Option<&Path>) -> Result<TrailSettings> {
    let path = path.map_or_else(trail_settings::settings_path, Path::to_path_buf);
    trail_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))
}

fn telemetry_config(settings: &TrailSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: trail_telemetry::parse_level(&settings.logging.level)
            .unwrap_or(tracing::Level::INFO),
        module_levels: Vec::new(),
        json: settings.logging.json,
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn build_runtime(settings: TrailSettings, db_path: Option<PathBuf>) -> Result<Runtime> {
    let db_path = db_path.unwrap_or_else(|| settings.storage.resolved_database_path());
    ensure_parent_dir(&db_path)?;
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let transport = HttpTransport::new(
        settings.api.base_url.clone(),
        Duration::from_millis(settings.api.timeout_ms),
    )?;
    let deps = RuntimeDeps {
        transport: Arc::new(transport),
        reachability: Arc::new(ManualReachability::new(true)),
        clock: Arc::new(SystemClock),
        device_info: None,
    };
    Ok(Runtime::build(settings, db, deps)?)
}

async fn run(runtime: &Runtime) -> Result<()> {
    runtime.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut queued = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: ServiceEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed event");
                continue;
            }
        };
        match runtime.ingest(event).await {
            Ok(n) => queued += n,
            Err(e) if e.is_unrestorable() => {
                runtime.stop().await;
                bail!("delivery stopped: {e}");
            }
            Err(e) => tracing::warn!(line = line_no, error = %e, "event not queued"),
        }
    }
    tracing::info!(queued, "end of input");

    let flushed = runtime.flush().await;
    runtime.stop().await;
    let outcome = flushed?;
    tracing::info!(sent = outcome.events_sent(), drained = outcome.drained(), "final flush");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;
    trail_telemetry::init_telemetry(&telemetry_config(&settings));

    let runtime = build_runtime(settings, cli.db_path)?;

    match cli.command {
        Command::Run => run(&runtime).await?,
        Command::Flush => {
            let outcome = runtime.flush().await?;
            println!("{}", outcome.events_sent());
        }
        Command::Status => {
            let status = runtime.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Purge => {
            let removed = runtime.purge()?;
            println!("{removed}");
        }
    }
    Ok(())
}
