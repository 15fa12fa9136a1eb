//! hostsnap - Main entry point
//!
//! Runs one backup: archives every configured destination, exports the
//! package inventory and MySQL dumps, then prunes expired backup sets.

use anyhow::{Context, Result};
use clap::Parser;
use hostsnap::{config::Config, daemon::shutdown::ShutdownCoordinator, utils, BackupExecutor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = hostsnap::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Only delete backup sets past the retention time
    #[arg(long)]
    prune_only: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, Some(config.backup.log_file.as_path()))?;

    tracing::info!(
        "Starting hostsnap v{} (backup_dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.backup_dir.display()
    );

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let executor = BackupExecutor::with_cancel(config, shutdown.token());

    if args.prune_only {
        let pruned = executor.prune().await?;
        tracing::info!("Removed {} expired backup set(s).", pruned.removed_count());
        if args.json {
            println!("{}", serde_json::to_string_pretty(&pruned)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let signals = Arc::clone(&shutdown);
    let signal_handle = tokio::spawn(async move { signals.wait_for_signal().await });

    let result = executor.execute_run().await;
    signal_handle.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Backup error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
