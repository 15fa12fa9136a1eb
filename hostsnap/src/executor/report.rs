//! Run report: what one backup run did, serializable for `--json`.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::Destination;
use crate::exporters::mysql::DatabaseExport;
use crate::exporters::ExportStatus;
use crate::pipeline::ArchiveStats;
use crate::planner::BackupKind;
use crate::retention::PruneReport;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub hostname: String,
    pub backup_set: PathBuf,
    pub destinations: Vec<DestinationReport>,
    pub packages: Option<ExportStatus>,
    pub databases: Vec<DatabaseExport>,
    pub pruning: Option<PruneReport>,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Stopped early; later destinations, exporters and pruning did not run
    Aborted { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationReport {
    pub archive: String,
    pub source: PathBuf,
    pub kind: Option<BackupKind>,
    pub file: Option<PathBuf>,
    pub status: DestinationStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DestinationStatus {
    Pending,
    Succeeded {
        stats: ArchiveStats,
        /// Counter value committed, if this destination keeps one
        counter: Option<u32>,
    },
    Failed {
        reason: String,
    },
}

impl RunReport {
    pub fn new(hostname: String, backup_set: PathBuf, started_at: DateTime<Local>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: None,
            hostname,
            backup_set,
            destinations: Vec::new(),
            packages: None,
            databases: Vec::new(),
            pruning: None,
            outcome: RunOutcome::Completed,
        }
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.outcome = RunOutcome::Aborted {
            reason: reason.into(),
        };
        self.finished_at = Some(Local::now());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Local::now());
    }

    pub fn failed_destinations(&self) -> usize {
        self.destinations
            .iter()
            .filter(|d| matches!(d.status, DestinationStatus::Failed { .. }))
            .count()
    }

    /// Completed and every destination archived
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
            && self
                .destinations
                .iter()
                .all(|d| matches!(d.status, DestinationStatus::Succeeded { .. }))
    }
}

impl DestinationReport {
    pub fn new(destination: &Destination) -> Self {
        Self {
            archive: destination.archive.clone(),
            source: destination.path.clone(),
            kind: None,
            file: None,
            status: DestinationStatus::Pending,
        }
    }

    pub fn succeeded(mut self, stats: ArchiveStats, counter: Option<u32>) -> Self {
        self.status = DestinationStatus::Succeeded { stats, counter };
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.status = DestinationStatus::Failed {
            reason: reason.into(),
        };
        self
    }
}
