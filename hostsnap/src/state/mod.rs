//! Persisted per-destination state: the incremental counter and the
//! snapshot token (GNU tar `--listed-incremental` file).
//!
//! Both live directly under the backup root, keyed by archive name:
//!
//! - `incremental_count_<archive>.txt`
//! - `snapshot_<archive>.snar`
//!
//! Captures never touch the committed token. They run against a staged copy
//! (`snapshot_<archive>.snar.pending`) which [`StateStore::save`] renames
//! into place after the archive was written, so a failed run leaves the
//! committed records exactly as they were.

use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::utils::errors::{Result, SnapError};

/// State of one destination carried across runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DestinationState {
    pub incremental_count: u32,

    /// Whether a committed snapshot token exists. Its content is opaque.
    pub has_snapshot: bool,
}

/// How a capture starts from the snapshot token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Start from no token; the capture is a full level-0 dump
    Reset,
    /// Continue from the committed token
    Reuse,
}

/// File-backed state store rooted at the backup directory
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn counter_path(&self, archive: &str) -> PathBuf {
        self.root.join(format!("incremental_count_{}.txt", archive))
    }

    pub fn snapshot_path(&self, archive: &str) -> PathBuf {
        self.root.join(format!("snapshot_{}.snar", archive))
    }

    pub fn staged_snapshot_path(&self, archive: &str) -> PathBuf {
        self.root.join(format!("snapshot_{}.snar.pending", archive))
    }

    /// Load the committed state; a destination never saved loads as zero/absent
    pub fn load(&self, archive: &str) -> Result<DestinationState> {
        let incremental_count = match fs::read_to_string(self.counter_path(archive)) {
            Ok(raw) => raw.trim().parse::<u32>().map_err(|e| {
                SnapError::state(archive, format!("counter file holds '{}': {}", raw.trim(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(SnapError::state(
                    archive,
                    format!("cannot read counter file: {}", e),
                ))
            }
        };

        Ok(DestinationState {
            incremental_count,
            has_snapshot: self.snapshot_path(archive).is_file(),
        })
    }

    /// Prepare the token a capture will read and rewrite; returns its path
    pub fn stage_snapshot(&self, archive: &str, mode: SnapshotMode) -> Result<PathBuf> {
        let staged = self.staged_snapshot_path(archive);
        remove_if_present(&staged)
            .map_err(|e| SnapError::state(archive, format!("cannot clear staged snapshot: {}", e)))?;

        if mode == SnapshotMode::Reuse {
            fs::copy(self.snapshot_path(archive), &staged).map_err(|e| {
                SnapError::state(archive, format!("cannot stage snapshot token: {}", e))
            })?;
        }
        Ok(staged)
    }

    /// Drop a staged token after a failed capture
    pub fn discard_staged(&self, archive: &str) -> Result<()> {
        remove_if_present(&self.staged_snapshot_path(archive))
            .map_err(|e| SnapError::state(archive, format!("cannot discard staged snapshot: {}", e)))
    }

    /// Commit state after a successful archive write.
    ///
    /// The counter is written to a temp file first. With `has_snapshot` set,
    /// the staged token produced by the capture then replaces the committed
    /// one, and the counter temp file is renamed into place last. A counter
    /// that cannot be written leaves both committed records untouched.
    pub fn save(&self, archive: &str, state: &DestinationState) -> Result<()> {
        let staged = self.staged_snapshot_path(archive);
        if state.has_snapshot && !staged.is_file() {
            return Err(SnapError::state(
                archive,
                "capture left no snapshot token to commit",
            ));
        }

        let counter = self.counter_path(archive);
        let pending = write_temp_text(&counter, &state.incremental_count.to_string())
            .map_err(|e| SnapError::state(archive, format!("cannot write counter: {}", e)))?;

        if state.has_snapshot {
            if let Err(e) = fs::rename(&staged, self.snapshot_path(archive)) {
                let _ = fs::remove_file(&pending);
                return Err(SnapError::state(
                    archive,
                    format!("cannot commit snapshot token: {}", e),
                ));
            }
        }

        fs::rename(&pending, &counter)
            .map_err(|e| SnapError::state(archive, format!("cannot write counter: {}", e)))
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Write `body` next to `path` under a temp name; the caller renames it into place
fn write_temp_text(path: &Path, body: &str) -> std::io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "invalid state file path"))?;
    let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
    fs::write(&tmp, body)?;
    Ok(tmp)
}
