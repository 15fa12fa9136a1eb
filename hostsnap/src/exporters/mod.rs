//! Side exporters run once per backup run: installed-package inventory and
//! MySQL dumps. Both are best-effort: failures are logged and reported, never
//! propagated.

pub mod mysql;
pub mod packages;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Result of one export step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportStatus {
    Written { file: PathBuf },
    Skipped { reason: String },
    Failed { error: String },
}

impl ExportStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ExportStatus::Failed { .. })
    }
}

/// True when `program --version` runs and exits cleanly
pub(crate) async fn command_works(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run `command` with stdout redirected into `file`; returns stderr's last line on failure
pub(crate) async fn run_into_file(mut command: Command, file: &Path) -> Result<(), String> {
    let out = std::fs::File::create(file)
        .map_err(|e| format!("cannot create {}: {}", file.display(), e))?;

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to run: {}", e))?
        .wait_with_output()
        .await
        .map_err(|e| format!("failed to run: {}", e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("no diagnostics");
        Err(format!("exited with {}: {}", output.status, detail))
    }
}
