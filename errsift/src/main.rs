//! errsift - incremental error-log harvester
//!
//! Watches the newest log file of every configured (source, stream), feeds
//! lines appended since the last cycle to the analysis pipeline and writes a
//! root-cause report per file.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/errsift/config.toml and sources.toml
//! - Database: $XDG_DATA_HOME/errsift/state.db (~/.local/share/errsift/state.db)
//! - Results: $XDG_DATA_HOME/errsift/results/{source}/{stream}/{file}
//! - Logs: $XDG_STATE_HOME/errsift/ (~/.local/state/errsift/)

mod process_lock;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use errsift_core::{
    BatchMode, Config, CycleReport, OffsetStore, Orchestrator, RunStatus, Scheduler, Shutdown,
    SourceRegistry, UnitOutcome,
};
use process_lock::acquire_ingest_guard;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "errsift")]
#[command(about = "Harvest new error lines from rotating logs and summarize them")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/errsift/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Source inventory (default: paths.sources_file or $XDG_CONFIG_HOME/errsift/sources.toml)
    #[arg(long, global = true)]
    sources: Option<PathBuf>,

    /// Verbose output (-v logs to stderr, -vv at debug level)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cycle now, then every interval until Ctrl+C (default)
    Run {
        /// Override schedule.every_minutes
        #[arg(long)]
        every_minutes: Option<u64>,

        /// Process work units one at a time
        #[arg(long)]
        serial: bool,
    },
    /// Run a single cycle and print a per-unit summary
    Once {
        /// Process work units one at a time
        #[arg(long)]
        serial: bool,
    },
    /// Validate configuration and inventory, print resolved work units
    Check,
    /// List stored per-file offsets
    Offsets,
    /// Show recent execution history
    History {
        /// Number of records to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let mut config = load_config(&args)?;
    if args.verbose >= 1 {
        config.logging.stderr = true;
    }
    if args.verbose >= 2 {
        config.logging.level = "debug".to_string();
    }

    // Initialize logging
    let _log_guard =
        errsift_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "errsift starting");

    match args.command.unwrap_or(Command::Run {
        every_minutes: None,
        serial: false,
    }) {
        Command::Run {
            every_minutes,
            serial,
        } => run(&config, every_minutes, serial),
        Command::Once { serial } => once(&config, serial),
        Command::Check => check(&config),
        Command::Offsets => offsets(&config),
        Command::History { limit } => history(&config, limit),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = Config::load_from(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => Config::load().context("failed to load configuration")?,
    };

    if let Some(sources) = &args.sources {
        config.paths.sources_file = Some(sources.clone());
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_registry(config: &Config) -> Result<SourceRegistry> {
    let path = config.sources_path();
    SourceRegistry::load(&path, config.paths.mount_root.clone())
        .with_context(|| format!("failed to load source inventory {}", path.display()))
}

fn open_store(config: &Config) -> Result<OffsetStore> {
    let db_path = config.database_path();
    let store = OffsetStore::open(
        &db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .with_context(|| format!("failed to open offset store {}", db_path.display()))?;
    store
        .migrate()
        .context("failed to run database migrations")?;
    Ok(store)
}

/// Long-running mode: cycle now, then on the configured interval
fn run(config: &Config, every_minutes: Option<u64>, serial: bool) -> Result<()> {
    let _guard = acquire_ingest_guard(&config.database_path())?;

    let mut registry = load_registry(config)?;
    if let Some(minutes) = every_minutes {
        registry.schedule_mut().every_minutes = minutes;
    }
    if serial {
        registry.schedule_mut().parallel = false;
    }
    registry
        .schedule()
        .validate()
        .context("invalid --every-minutes")?;
    let interval = registry.schedule().interval();

    let orchestrator = Orchestrator::from_config(config, registry)
        .context("failed to initialize orchestrator")?;

    // Set up signal handler for graceful shutdown
    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down after the current cycle...");
        trigger.trigger();
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "errsift running: {} work unit(s), every {} minute(s), {} mode. Press Ctrl+C to stop.",
        orchestrator.registry().work_units().len(),
        interval.as_secs() / 60,
        orchestrator.mode().as_str()
    );

    let scheduler = Scheduler::new(interval, shutdown);
    scheduler.run_forever(|| {
        let report = orchestrator.run_cycle();
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        println!(
            "[{}] {}: {} analyzed, {} failed, {} unit(s) in {}ms",
            timestamp,
            report.status().as_str(),
            report.analyzed(),
            report.failed(),
            report.units.len(),
            report.duration.as_millis()
        );
    });

    println!("errsift stopped.");
    Ok(())
}

/// Single cycle with a per-unit summary
fn once(config: &Config, serial: bool) -> Result<()> {
    let _guard = acquire_ingest_guard(&config.database_path())?;

    let registry = load_registry(config)?;
    let mut orchestrator = Orchestrator::from_config(config, registry)
        .context("failed to initialize orchestrator")?;
    if serial {
        orchestrator = orchestrator.with_mode(BatchMode::Serial);
    }

    let report = orchestrator.run_cycle();
    print_cycle_report(&report);

    if report.status() == RunStatus::Failed {
        anyhow::bail!("every work unit failed");
    }
    Ok(())
}

fn print_cycle_report(report: &CycleReport) {
    println!("Cycle {} ({})", report.run_id, report.status().as_str());
    println!("  Mode:      {}", report.mode.as_str());
    println!("  Units:     {}", report.units.len());
    println!("  Analyzed:  {}", report.analyzed());
    println!("  Failed:    {}", report.failed());
    println!("  Duration:  {}ms", report.duration.as_millis());

    if report.units.is_empty() {
        return;
    }
    println!();
    for unit in &report.units {
        let label = format!("{}/{}", unit.source, unit.stream);
        let detail = match &unit.outcome {
            UnitOutcome::NoFile => "no matching file".to_string(),
            UnitOutcome::NoNewLines { file, offset } => {
                format!("no new lines ({} @ {})", file, offset)
            }
            UnitOutcome::Analyzed {
                file,
                lines,
                offset,
                committed,
                ..
            } => format!(
                "analyzed {} line(s) ({} @ {}{})",
                lines,
                file,
                offset,
                if *committed { "" } else { ", offset not saved" }
            ),
            UnitOutcome::Failed { error } => format!("FAILED: {}", error),
        };
        println!("  {:<32} {}", label, detail);
    }
}

/// Validate everything without touching logs or the store
fn check(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    let schedule = registry.schedule();

    println!("Configuration OK");
    println!("  Inventory:   {}", config.sources_path().display());
    println!("  Mount root:  {}", registry.mount_root().display());
    println!("  Database:    {}", config.database_path().display());
    println!("  Results:     {}", config.results_dir().display());
    println!("  Logs:        {}", errsift_core::logging::log_dir().display());
    println!(
        "  Analysis:    {}",
        match &config.llm {
            Some(llm) => format!("{:?} ({})", llm.provider, llm.model),
            None => "offline digest".to_string(),
        }
    );
    println!(
        "  Notifier:    {}",
        if config.notifier.webhook_url.is_some() {
            "webhook"
        } else {
            "log"
        }
    );
    println!(
        "  Schedule:    every {} minute(s), {}, max {} workers, unit timeout {}s",
        schedule.every_minutes,
        if schedule.parallel { "parallel" } else { "serial" },
        schedule.max_workers,
        schedule.unit_timeout_secs
    );

    let disabled: Vec<_> = registry
        .sources()
        .iter()
        .filter(|s| !s.enabled)
        .map(|s| s.name.as_str())
        .collect();
    if !disabled.is_empty() {
        println!("  Disabled:    {}", disabled.join(", "));
    }

    let units = registry.work_units();
    println!();
    println!("Work units ({}):", units.len());
    for unit in &units {
        println!(
            "  {:<32} {:<6} {}/{} [{}]",
            unit.label(),
            unit.source.kind.as_str(),
            unit.base_path.trim_end_matches('/'),
            unit.stream.file_glob,
            unit.stream.parser
        );
    }
    Ok(())
}

fn offsets(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let records = store.list_offsets().context("failed to list offsets")?;

    if records.is_empty() {
        println!("No offsets stored yet.");
        return Ok(());
    }

    println!("{:<20} {:<20} {:<40} {:>12}  UPDATED", "SOURCE", "STREAM", "FILE", "OFFSET");
    for record in records {
        println!(
            "{:<20} {:<20} {:<40} {:>12}  {}",
            record.key.source,
            record.key.stream,
            record.key.file_key,
            record.offset,
            record
                .updated_at
                .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn history(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let records = store
        .recent_executions(limit)
        .context("failed to read execution history")?;

    if records.is_empty() {
        println!("No cycles recorded yet.");
        return Ok(());
    }

    for record in records {
        let units = record.payload.get("units").and_then(|v| v.as_u64()).unwrap_or(0);
        println!(
            "{}  {:<16} {:>4} unit(s) {:>8}ms  {}",
            record
                .run_time
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S"),
            record.status.as_str(),
            units,
            record.duration_ms,
            record.run_id
        );
    }
    Ok(())
}
