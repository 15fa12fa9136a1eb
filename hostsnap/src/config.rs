//! Configuration management for hostsnap.
//!
//! Loads configuration from a YAML (or TOML/JSON) file with environment
//! variable overrides (`HOSTSNAP_BACKUP__BACKUP_DIR=/mnt/backup`).

use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::Compression;
use crate::utils::errors::{Result, SnapError};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostsnap/backup_config.yaml";

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "HOSTSNAP";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backup: BackupConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Append-only backup log
    pub log_file: PathBuf,

    /// Root under which date-stamped backup sets and state files live
    pub backup_dir: PathBuf,

    /// Number of runs after which an incremental destination takes a full backup
    pub full_backup_interval: u32,

    /// Compression applied to every archive (tar, gzip, bzip2, xz, zstd)
    #[serde(default)]
    pub compression: Compression,

    /// Days to keep backup sets, or `false` to keep them forever
    #[serde(default)]
    pub retention_time: Retention,

    /// Backup targets, processed in order
    #[serde(default)]
    pub destinations: Vec<Destination>,

    #[serde(default)]
    pub mysql: MysqlConfig,

    /// Overrides the resolved hostname used in archive names
    #[serde(default)]
    pub hostname: Option<String>,

    /// Kill a pipeline that runs longer than this (no limit when unset)
    #[serde(default)]
    pub pipeline_timeout_secs: Option<u64>,

    #[serde(default)]
    pub tools: Tools,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Destination {
    /// Directory or file to archive
    pub path: PathBuf,

    /// Archive base name, also the key of the persisted state
    pub archive: String,

    #[serde(rename = "type")]
    pub backup_type: BackupType,

    /// Patterns handed verbatim to the archiver's `--exclude`
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Configured backup type of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum BackupType {
    Full,
    Incremental,
    FullSingle,
    /// Anything else; handled like `Full`
    Other(String),
}

impl From<String> for BackupType {
    fn from(raw: String) -> Self {
        match raw.trim() {
            "full" => BackupType::Full,
            "incremental" => BackupType::Incremental,
            "full-single" => BackupType::FullSingle,
            _ => BackupType::Other(raw),
        }
    }
}

/// Retention window for backup sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    #[default]
    Disabled,
    Days(u32),
}

impl Retention {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Retention::Disabled => None,
            Retention::Days(days) => Some(Duration::from_secs(u64::from(*days) * 86_400)),
        }
    }
}

impl<'de> Deserialize<'de> for Retention {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Days(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(Retention::Disabled),
            Raw::Flag(true) => Err(de::Error::custom(
                "retention_time must be a number of days or false",
            )),
            Raw::Days(days) if days <= 0 => Ok(Retention::Disabled),
            Raw::Days(days) => u32::try_from(days)
                .map(Retention::Days)
                .map_err(|_| de::Error::custom(format!("retention_time {} is too large", days))),
        }
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct MysqlConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Server host; the client default applies when unset
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub databases: Vec<String>,
}

impl fmt::Debug for MysqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlConfig")
            .field("enabled", &self.enabled)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("databases", &self.databases)
            .finish()
    }
}

/// Paths of the external programs hostsnap runs.
#[derive(Debug, Clone, Deserialize)]
pub struct Tools {
    #[serde(default = "default_tar")]
    pub tar: PathBuf,

    #[serde(default = "default_gzip")]
    pub gzip: PathBuf,

    #[serde(default = "default_bzip2")]
    pub bzip2: PathBuf,

    #[serde(default = "default_xz")]
    pub xz: PathBuf,

    #[serde(default = "default_mysqldump")]
    pub mysqldump: PathBuf,

    #[serde(default = "default_dpkg")]
    pub dpkg: PathBuf,

    #[serde(default = "default_rpm")]
    pub rpm: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_tar() -> PathBuf {
    PathBuf::from("tar")
}

fn default_gzip() -> PathBuf {
    PathBuf::from("gzip")
}

fn default_bzip2() -> PathBuf {
    PathBuf::from("bzip2")
}

fn default_xz() -> PathBuf {
    PathBuf::from("xz")
}

fn default_mysqldump() -> PathBuf {
    PathBuf::from("mysqldump")
}

fn default_dpkg() -> PathBuf {
    PathBuf::from("dpkg")
}

fn default_rpm() -> PathBuf {
    PathBuf::from("rpm")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Tools {
    fn default() -> Self {
        Tools {
            tar: default_tar(),
            gzip: default_gzip(),
            bzip2: default_bzip2(),
            xz: default_xz(),
            mysqldump: default_mysqldump(),
            dpkg: default_dpkg(),
            rpm: default_rpm(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a file, applying `HOSTSNAP_*` environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SnapError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a sane run
    pub fn validate(&self) -> Result<()> {
        let backup = &self.backup;

        if backup.backup_dir.as_os_str().is_empty() {
            return Err(SnapError::Config("backup.backup_dir is empty".into()));
        }
        if backup.log_file.as_os_str().is_empty() {
            return Err(SnapError::Config("backup.log_file is empty".into()));
        }
        if backup.full_backup_interval == 0 {
            return Err(SnapError::Config(
                "backup.full_backup_interval must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for (idx, destination) in backup.destinations.iter().enumerate() {
            if destination.path.as_os_str().is_empty() {
                return Err(SnapError::Config(format!(
                    "backup.destinations[{}].path is empty",
                    idx
                )));
            }
            let archive = destination.archive.trim();
            if archive.is_empty() {
                return Err(SnapError::Config(format!(
                    "backup.destinations[{}].archive is empty",
                    idx
                )));
            }
            if archive.contains('/') || archive.contains('\\') || archive == "." || archive == ".." {
                return Err(SnapError::Config(format!(
                    "backup.destinations[{}].archive '{}' must be a plain name",
                    idx, destination.archive
                )));
            }
            if !seen.insert(archive) {
                return Err(SnapError::Config(format!(
                    "archive name '{}' is used by more than one destination",
                    archive
                )));
            }
        }

        if backup.mysql.enabled && backup.mysql.user.trim().is_empty() {
            return Err(SnapError::Config(
                "backup.mysql.user is required when MySQL backup is enabled".into(),
            ));
        }
        let mysql = &backup.mysql;
        let credentials = [
            ("user", Some(mysql.user.as_str())),
            ("password", Some(mysql.password.as_str())),
            ("host", mysql.host.as_deref()),
        ];
        for (field, value) in credentials {
            // The option file can quote a value with ' or ", never both.
            if value.is_some_and(|v| v.contains('\'') && v.contains('"')) {
                return Err(SnapError::Config(format!(
                    "backup.mysql.{} cannot contain both single and double quotes",
                    field
                )));
            }
        }

        for db in &backup.mysql.databases {
            if db.is_empty() || db.starts_with('-') || db.contains('/') {
                return Err(SnapError::Config(format!(
                    "backup.mysql.databases entry '{}' is not a valid database name",
                    db
                )));
            }
        }

        Ok(())
    }
}

impl BackupConfig {
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_secs.map(Duration::from_secs)
    }
}
