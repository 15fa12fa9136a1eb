//! Installed-package inventory.
//!
//! Writes `installed_packages.txt` into the backup set from `dpkg
//! --get-selections`, or `rpm -qa` on RPM systems.

use std::path::Path;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::{command_works, run_into_file, ExportStatus};
use crate::config::Tools;

pub const INVENTORY_FILE: &str = "installed_packages.txt";

/// Package manager found on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dpkg,
    Rpm,
}

impl PackageManager {
    /// Probe dpkg first, then rpm
    pub async fn detect(tools: &Tools) -> Option<Self> {
        if command_works(&tools.dpkg).await {
            Some(PackageManager::Dpkg)
        } else if command_works(&tools.rpm).await {
            Some(PackageManager::Rpm)
        } else {
            None
        }
    }

    fn command(&self, tools: &Tools) -> Command {
        match self {
            PackageManager::Dpkg => {
                let mut cmd = Command::new(&tools.dpkg);
                cmd.arg("--get-selections");
                cmd
            }
            PackageManager::Rpm => {
                let mut cmd = Command::new(&tools.rpm);
                cmd.arg("-qa");
                cmd
            }
        }
    }
}

/// Save the installed package list into `set_dir`
pub async fn export_installed_packages(set_dir: &Path, tools: &Tools) -> ExportStatus {
    info!("Securing installed packages...");

    let Some(manager) = PackageManager::detect(tools).await else {
        warn!("No supported package manager (dpkg or rpm) found.");
        return ExportStatus::Skipped {
            reason: "no supported package manager (dpkg or rpm) found".to_string(),
        };
    };

    let file = set_dir.join(INVENTORY_FILE);
    match run_into_file(manager.command(tools), &file).await {
        Ok(()) => {
            info!("Installed packages were successfully saved to {}.", file.display());
            ExportStatus::Written { file }
        }
        Err(e) => {
            error!("Error saving installed packages: {}", e);
            ExportStatus::Failed { error: e }
        }
    }
}
