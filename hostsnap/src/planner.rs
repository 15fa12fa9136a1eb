//! Destination planner: full vs incremental decision, archive naming and
//! the state to commit once the archive is written.

use serde::Serialize;
use std::fmt;

use crate::config::{BackupType, Destination};
use crate::pipeline::Compression;
use crate::state::{DestinationState, SnapshotMode};

/// Kind of capture a run performs, also the tag in the archive name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Full,
    Incremental,
    FullSingle,
}

impl BackupKind {
    pub fn tag(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::FullSingle => "full-single",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Whether the capture uses snapshot state at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// No snapshot token is read or written
    Plain,
    Snapshot(SnapshotMode),
}

/// Everything decided for one destination in one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub kind: BackupKind,
    pub capture: CaptureMode,

    /// Counter value used in the archive name
    pub counter: u32,

    pub archive_file: String,

    /// State to commit after a successful write; `None` commits nothing
    pub next_state: Option<DestinationState>,
}

/// Decide how to back up `destination` given its persisted `state`.
///
/// Incremental destinations take a full backup when the counter reached
/// `full_backup_interval` or no snapshot token exists, resetting the counter.
/// Every committed run then advances the counter by one. `full-single`
/// destinations never read or write snapshot state and never advance.
pub fn plan(
    destination: &Destination,
    state: &DestinationState,
    full_backup_interval: u32,
    hostname: &str,
    compression: Compression,
) -> Plan {
    let counter = state.incremental_count;

    let (kind, capture, base) = match destination.backup_type {
        BackupType::FullSingle => (BackupKind::FullSingle, CaptureMode::Plain, None),
        BackupType::Incremental => {
            if counter >= full_backup_interval || !state.has_snapshot {
                (
                    BackupKind::Full,
                    CaptureMode::Snapshot(SnapshotMode::Reset),
                    Some(0),
                )
            } else {
                (
                    BackupKind::Incremental,
                    CaptureMode::Snapshot(SnapshotMode::Reuse),
                    Some(counter),
                )
            }
        }
        BackupType::Full | BackupType::Other(_) => (
            BackupKind::Full,
            CaptureMode::Snapshot(SnapshotMode::Reset),
            Some(counter),
        ),
    };

    let next_state = base.map(|base: u32| DestinationState {
        incremental_count: base.saturating_add(1),
        has_snapshot: true,
    });

    Plan {
        kind,
        capture,
        counter,
        archive_file: archive_file_name(hostname, &destination.archive, kind, counter, compression),
        next_state,
    }
}

/// `{hostname}_{archive}_{tag}-{counter}.tar[.{suffix}]`
pub fn archive_file_name(
    hostname: &str,
    archive: &str,
    kind: BackupKind,
    counter: u32,
    compression: Compression,
) -> String {
    let mut name = format!("{}_{}_{}-{}.tar", hostname, archive, kind.tag(), counter);
    if let Some(suffix) = compression.suffix() {
        name.push('.');
        name.push_str(suffix);
    }
    name
}
