//! Backup run executor - Orchestrates one backup run.
//!
//! Destinations are processed one at a time, in configured order:
//! state load, plan, archive pipeline, state commit. A destination that
//! fails is logged and skipped. An unexpected pipeline error (cancellation,
//! a crashed stage) aborts the run: remaining destinations, the exporters
//! and pruning are not attempted.

pub mod report;

use chrono::Local;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BackupType, Config, Destination};
use crate::exporters::{mysql, packages};
use crate::pipeline::{ArchivePipeline, CaptureSpec, PipelineError, PipelineOutcome};
use crate::planner::{self, BackupKind, CaptureMode, Plan};
use crate::retention::{self, PruneReport};
use crate::state::StateStore;
use crate::utils::errors::{Result, SnapError};
pub use report::{DestinationReport, DestinationStatus, RunOutcome, RunReport};

/// Date stamp naming a backup set directory
const BACKUP_SET_FORMAT: &str = "%Y-%m-%d";

/// Main backup executor
pub struct BackupExecutor {
    config: Config,
    state: StateStore,
    pipeline: ArchivePipeline,
    cancel: CancellationToken,
}

impl BackupExecutor {
    /// Create a new backup executor (no cancellation support)
    pub fn new(config: Config) -> Self {
        Self::with_cancel(config, CancellationToken::new())
    }

    /// Create a new backup executor with cancellation support
    pub fn with_cancel(config: Config, cancel: CancellationToken) -> Self {
        let state = StateStore::new(&config.backup.backup_dir);
        let pipeline = ArchivePipeline::new(config.backup.tools.clone())
            .with_timeout(config.backup.pipeline_timeout())
            .with_cancel(cancel.clone());

        Self {
            config,
            state,
            pipeline,
            cancel,
        }
    }

    /// Execute one backup run.
    ///
    /// Only failing to prepare the backup set is an `Err`; everything later
    /// is recorded in the returned report.
    pub async fn execute_run(&self) -> Result<RunReport> {
        let backup = &self.config.backup;
        info!("Starting backup process...");

        let hostname = resolve_hostname(backup.hostname.as_deref());
        info!("Hostname: {}", hostname);

        let started_at = Local::now();
        let date = started_at.format(BACKUP_SET_FORMAT).to_string();
        let set_dir = backup.backup_dir.join(&date);
        info!("Backup directory: {}", set_dir.display());
        ensure_backup_set(&set_dir)?;

        let mut report = RunReport::new(hostname, set_dir.clone(), started_at);

        for destination in &backup.destinations {
            if self.cancel.is_cancelled() {
                return Ok(self.abort(report, PipelineError::Cancelled));
            }
            match self
                .process_destination(destination, &report.hostname, &set_dir)
                .await
            {
                Ok(outcome) => report.destinations.push(outcome),
                Err((failed, e)) => {
                    report.destinations.push(failed);
                    return Ok(self.abort(report, e));
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(self.abort(report, PipelineError::Cancelled));
        }

        report.packages = Some(packages::export_installed_packages(&set_dir, &backup.tools).await);
        report.databases = mysql::export_databases(&backup.mysql, &set_dir, &backup.tools).await;

        match self.prune().await {
            Ok(pruned) => report.pruning = Some(pruned),
            Err(e) => error!("Error while deleting old backups: {}", e),
        }

        report.finish();
        if report.is_success() {
            info!("Backup of {} completed successfully.", date);
        } else {
            warn!(
                "Backup of {} completed with {} failed destination(s).",
                date,
                report.failed_destinations()
            );
        }
        Ok(report)
    }

    /// Run only the retention pruner
    pub async fn prune(&self) -> Result<PruneReport> {
        let root = self.config.backup.backup_dir.clone();
        let retention = self.config.backup.retention_time;

        tokio::task::spawn_blocking(move || retention::prune(&root, retention))
            .await
            .map_err(|e| SnapError::Pipeline(PipelineError::Join(e)))?
    }

    fn abort(&self, mut report: RunReport, e: PipelineError) -> RunReport {
        error!("Backup error: {}", e);
        report.abort(e.to_string());
        report
    }

    /// Archive one destination. `Err` carries the destination's failed
    /// report and the error that aborts the run.
    async fn process_destination(
        &self,
        destination: &Destination,
        hostname: &str,
        set_dir: &Path,
    ) -> std::result::Result<DestinationReport, (DestinationReport, PipelineError)> {
        let backup = &self.config.backup;
        let archive = destination.archive.as_str();
        let mut report = DestinationReport::new(destination);

        info!("Processing destination: {}", destination.path.display());

        let state = match self.state.load(archive) {
            Ok(state) => state,
            Err(e) => {
                error!("Cannot load state for {}: {}", archive, e);
                return Ok(report.failed(e.to_string()));
            }
        };
        info!(
            "Incremental counter for {}: {}",
            archive, state.incremental_count
        );

        let plan = planner::plan(
            destination,
            &state,
            backup.full_backup_interval,
            hostname,
            backup.compression,
        );
        self.log_decision(destination, &plan);

        report.kind = Some(plan.kind);

        let listed_incremental = match plan.capture {
            CaptureMode::Plain => None,
            CaptureMode::Snapshot(mode) => match self.state.stage_snapshot(archive, mode) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!("Cannot prepare snapshot for {}: {}", archive, e);
                    return Ok(report.failed(e.to_string()));
                }
            },
        };

        let output = set_dir.join(&plan.archive_file);
        report.file = Some(output.clone());

        let spec = CaptureSpec {
            source: destination.path.clone(),
            excludes: destination.exclude.clone(),
            listed_incremental,
        };

        let outcome = match self.pipeline.run(&spec, backup.compression, &output).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard_staged(archive);
                return Err((report.failed(e.to_string()), e));
            }
        };

        let stats = match outcome {
            PipelineOutcome::Success(stats) => stats,
            PipelineOutcome::Failed(reason) => {
                error!(
                    "Error creating archive for {}: {}",
                    destination.path.display(),
                    reason
                );
                self.discard_staged(archive);
                return Ok(report.failed(reason));
            }
        };
        info!(
            "Archive successfully created: {} ({})",
            output.display(),
            stats.summary()
        );

        let Some(next) = plan.next_state else {
            return Ok(report.succeeded(stats, None));
        };

        match self.state.save(archive, &next) {
            Ok(()) => {
                info!(
                    "Incremental counter for {} updated: {}",
                    archive, next.incremental_count
                );
                Ok(report.succeeded(stats, Some(next.incremental_count)))
            }
            Err(e) => {
                error!("Archive written but state was not committed: {}", e);
                self.discard_staged(archive);
                Ok(report.failed(e.to_string()))
            }
        }
    }

    fn log_decision(&self, destination: &Destination, plan: &Plan) {
        let archive = &destination.archive;
        let snapshot = self.state.snapshot_path(archive);

        match (&destination.backup_type, plan.kind) {
            (BackupType::Incremental, BackupKind::Full) => info!(
                "Snapshot file not found or counter reached. Perform full backup for {}.",
                archive
            ),
            (_, BackupKind::Incremental) => info!(
                "Incremental backup is performed using snapshot file {}.",
                snapshot.display()
            ),
            (_, BackupKind::FullSingle) => info!("Perform full-single backup for {}.", archive),
            (backup_type, BackupKind::Full) => {
                if let BackupType::Other(raw) = backup_type {
                    warn!("Unknown backup type '{}' for {}, treating it as full.", raw, archive);
                }
                info!(
                    "Perform full backup for {} and create snapshot file {}.",
                    archive,
                    snapshot.display()
                );
            }
        }
    }

    fn discard_staged(&self, archive: &str) {
        if let Err(e) = self.state.discard_staged(archive) {
            warn!("{}", e);
        }
    }
}

/// Configured override, else the system hostname
fn resolve_hostname(configured: Option<&str>) -> String {
    if let Some(name) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        return name.to_string();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Create the backup set directory; an existing one is reused as is
fn ensure_backup_set(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        info!("Backup directory {} already exists.", dir.display());
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    info!("Backup directory {} was created.", dir.display());
    Ok(())
}
