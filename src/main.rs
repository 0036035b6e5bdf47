//! # Tidewatch CLI
//!
//! Runs the farm data-collection jobs declared in a TOML config file.
//!
//! Usage:
//!   tidewatch                            # Run the scheduler (default config)
//!   tidewatch run --status-every 30      # Log a status line every 30s
//!   tidewatch -c ./scheduler.toml check  # Validate config and list tasks
//!   tidewatch init                       # Write a starter config file

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tidewatch_core::{LoggingConfig, ScheduleConfig, TaskConfig, TidewatchConfig};
use tidewatch_scheduler::{ScheduleRule, TaskScheduler};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Parser)]
#[command(
    name = "tidewatch",
    version,
    about = "🌊 Tidewatch: interval and one-shot task scheduler"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl+C / SIGTERM
    Run {
        /// Seconds between status log lines (0 = off)
        #[arg(long, default_value = "60")]
        status_every: u64,

        /// Seconds to wait for running tasks on shutdown
        #[arg(long, default_value = "10")]
        grace_period: u64,
    },

    /// Validate the config file and list its tasks
    Check,

    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    match &cli.config {
        Some(p) => PathBuf::from(shellexpand::tilde(p).as_ref()),
        None => TidewatchConfig::default_path(),
    }
}

/// An explicit `--config` must exist; the default path falls back to defaults.
fn load_config(cli: &Cli, path: &Path) -> Result<TidewatchConfig> {
    match &cli.config {
        Some(_) => TidewatchConfig::load_from(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(TidewatchConfig::load()?),
    }
}

/// Console output, plus a plain-text file when `logging.log_dir` is set.
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = format!("tidewatch={level},tidewatch_core={level},tidewatch_scheduler={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let console: Box<dyn Layer<Registry> + Send + Sync> = if logging.json {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };
    let mut layers = vec![console];

    let log_path = logging.file_path();
    if let Some(path) = &log_path {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).with(filter).init();
    if let Some(path) = log_path {
        tracing::info!("📝 Logging to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config_path(&cli);

    match cli.command {
        Some(Commands::Init { force }) => {
            init_logging(cli.verbose, &LoggingConfig::default())?;
            init_config(&path, force)
        }
        Some(Commands::Check) => {
            let config = load_config(&cli, &path)?;
            init_logging(cli.verbose, &config.logging)?;
            check(&path, &config)
        }
        Some(Commands::Run { status_every, grace_period }) => {
            let config = load_config(&cli, &path)?;
            init_logging(cli.verbose, &config.logging)?;
            run(config, status_every, Duration::from_secs(grace_period)).await
        }
        None => {
            let config = load_config(&cli, &path)?;
            init_logging(cli.verbose, &config.logging)?;
            run(config, 60, Duration::from_secs(10)).await
        }
    }
}

async fn run(config: TidewatchConfig, status_every: u64, grace_period: Duration) -> Result<()> {
    let scheduler = TaskScheduler::new(config.scheduler.clone())?;
    for task in &config.tasks {
        scheduler
            .add_configured_task(task)
            .with_context(|| format!("registering task '{}'", task.id))?;
    }
    if config.tasks.is_empty() {
        tracing::warn!("⚠️ No tasks configured, the scheduler will idle");
    }

    scheduler.start()?;
    tracing::info!("🌊 Tidewatch running with {} task(s). Press Ctrl+C to stop.", scheduler.task_count());

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            res = &mut signal => {
                res.context("waiting for shutdown signal")?;
                break;
            }
            _ = ticker.tick(), if status_every > 0 => {
                tracing::info!("📊 {}", scheduler.status().summary());
            }
        }
    }

    if !scheduler.stop(grace_period).await {
        tracing::warn!("⚠️ Exiting with tasks still running");
    }
    let snapshot = scheduler.get_task_status(None)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn check(path: &Path, config: &TidewatchConfig) -> Result<()> {
    config.validate()?;
    let now = chrono::Utc::now();
    println!("✅ Config OK: {}", path.display());
    println!(
        "   Workers: {} | Poll: {:.1}s | Retries: {} (every {:.1}s) | Default timeout: {}s",
        config.scheduler.max_workers,
        config.scheduler.poll_interval_secs,
        config.scheduler.max_retries,
        config.scheduler.retry_delay_secs,
        config.scheduler.default_timeout_secs
    );
    println!("   Tasks: {}", config.tasks.len());
    for task in &config.tasks {
        let rule = ScheduleRule::try_from(&task.schedule)?;
        let first = rule
            .first_due(now)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        println!(
            "   {} {:<20} {:<28} first run: {}",
            if task.enabled { "✅" } else { "⬜" },
            task.id,
            rule.to_string(),
            first
        );
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = TidewatchConfig::default();
    config.logging.log_dir = Some("~/.tidewatch/logs".into());
    config.tasks.push(TaskConfig {
        id: "heartbeat".into(),
        name: Some("Heartbeat".into()),
        description: "Example task, enable and point at your script".into(),
        command: "echo".into(),
        args: vec!["tidewatch heartbeat".into()],
        working_dir: None,
        env: Default::default(),
        timeout_secs: Some(30),
        enabled: false,
        schedule: ScheduleConfig::Interval { every_secs: 30.0 },
    });
    config.save_to(path)?;
    println!("✅ Wrote starter config to {}", path.display());
    Ok(())
}
