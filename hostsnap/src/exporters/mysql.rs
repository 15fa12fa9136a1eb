//! MySQL dumps, one `<db>_backup.sql` per configured database.
//!
//! Credentials go to `mysqldump` through a private `--defaults-extra-file`
//! that exists only while the dumps run, keeping the password off the
//! command line.

use serde::Serialize;
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{error, info};

use super::{run_into_file, ExportStatus};
use crate::config::{MysqlConfig, Tools};

/// Outcome for one database
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseExport {
    pub database: String,
    #[serde(flatten)]
    pub status: ExportStatus,
}

pub fn dump_file_name(database: &str) -> String {
    format!("{}_backup.sql", database)
}

/// Dump every configured database into `set_dir`; failures are per database
pub async fn export_databases(
    mysql: &MysqlConfig,
    set_dir: &Path,
    tools: &Tools,
) -> Vec<DatabaseExport> {
    info!("Starting MySQL backup.");
    if !mysql.enabled {
        info!("MySQL backup is disabled.");
        return Vec::new();
    }

    let credentials = match write_credentials(mysql) {
        Ok(file) => file,
        Err(e) => {
            error!("Cannot prepare MySQL credentials file: {}", e);
            return mysql
                .databases
                .iter()
                .map(|db| DatabaseExport {
                    database: db.clone(),
                    status: ExportStatus::Failed {
                        error: format!("credentials file: {}", e),
                    },
                })
                .collect();
        }
    };

    let mut defaults_arg = OsString::from("--defaults-extra-file=");
    defaults_arg.push(credentials.path());

    let mut results = Vec::with_capacity(mysql.databases.len());
    for db in &mysql.databases {
        info!("Securing database {}.", db);
        let file = set_dir.join(dump_file_name(db));

        let mut cmd = Command::new(&tools.mysqldump);
        cmd.arg(&defaults_arg).arg(db);

        let status = match run_into_file(cmd, &file).await {
            Ok(()) => {
                info!(
                    "The database {} was successfully backed up to {}.",
                    db,
                    file.display()
                );
                ExportStatus::Written { file }
            }
            Err(e) => {
                error!("Error saving database {}: {}", db, e);
                ExportStatus::Failed { error: e }
            }
        };
        results.push(DatabaseExport {
            database: db.clone(),
            status,
        });
    }

    results
}

/// `[client]` option group for mysqldump
fn credentials_contents(mysql: &MysqlConfig) -> String {
    let mut body = String::from("[client]\n");
    body.push_str(&format!("user={}\n", option_value(&mysql.user)));
    body.push_str(&format!("password={}\n", option_value(&mysql.password)));
    if let Some(host) = &mysql.host {
        body.push_str(&format!("host={}\n", option_value(host)));
    }
    body
}

/// Quoted option value; values holding both quote kinds are rejected by `Config::validate`
fn option_value(raw: &str) -> String {
    let escaped = raw.replace('\\', "\\\\").replace('\n', "\\n");
    if escaped.contains('"') {
        format!("'{}'", escaped)
    } else {
        format!("\"{}\"", escaped)
    }
}

/// Created with mode 0600; removed when dropped
fn write_credentials(mysql: &MysqlConfig) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("hostsnap-mysql-")
        .suffix(".cnf")
        .tempfile()?;
    file.write_all(credentials_contents(mysql).as_bytes())?;
    file.flush()?;
    Ok(file)
}
