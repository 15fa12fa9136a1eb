//! Retention pruning of backup sets.
//!
//! Every immediate subdirectory of the backup root is one backup set. A set
//! whose modification time is at least the retention window old is removed
//! recursively. Regular files in the root (the state files) are ignored.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{error, info};
use walkdir::WalkDir;

use crate::config::Retention;
use crate::utils::errors::Result;

/// Outcome of one pruning pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PruneFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneFailure {
    pub path: PathBuf,
    pub error: String,
}

impl PruneReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Prune sets older than `retention` as of now
pub fn prune(root: &Path, retention: Retention) -> Result<PruneReport> {
    prune_at(root, retention, SystemTime::now())
}

/// Prune sets whose age at `now` is `>=` the retention window
pub fn prune_at(root: &Path, retention: Retention, now: SystemTime) -> Result<PruneReport> {
    let mut report = PruneReport::default();

    let sets = backup_sets(root)?;
    if sets.is_empty() {
        info!("No backups found to delete.");
        return Ok(report);
    }

    let (days, window) = match (retention, retention.as_duration()) {
        (Retention::Days(days), Some(window)) => (days, window),
        _ => {
            info!("Retention time is false, no old backups are deleted.");
            return Ok(report);
        }
    };

    for (name, path, modified) in sets {
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age < window {
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(
                    "Backup {} was deleted due to retention time (older than {} days).",
                    name, days
                );
                report.removed.push(path);
            }
            Err(e) => {
                error!("Failed to delete backup {}: {}", name, e);
                report.failed.push(PruneFailure {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(report)
}

/// Immediate subdirectories of `root` with their modification times
fn backup_sets(root: &Path) -> Result<Vec<(String, PathBuf, SystemTime)>> {
    if !root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("backup root {} is not a directory", root.display()),
        )
        .into());
    }

    let mut sets = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(std::io::Error::from(e).into()),
            Err(e) => {
                error!("Skipping unreadable entry in {}: {}", root.display(), e);
                continue;
            }
        };

        if !entry.file_type().is_dir() {
            continue;
        }

        let modified = match entry.metadata().map_err(std::io::Error::from).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                error!("Cannot read modification time of {}: {}", entry.path().display(), e);
                continue;
            }
        };

        sets.push((
            entry.file_name().to_string_lossy().to_string(),
            entry.path().to_path_buf(),
            modified,
        ));
    }

    Ok(sets)
}
