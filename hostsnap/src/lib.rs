//! hostsnap library
//!
//! Host backup orchestrator: per-destination full/incremental tar archives
//! driven by a persisted counter and snapshot token, package and MySQL
//! exports, and retention pruning of dated backup sets.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod exporters;
pub mod pipeline;
pub mod planner;
pub mod retention;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupExecutor, RunReport};
pub use utils::errors::SnapError;
pub type Result<T> = std::result::Result<T, SnapError>;
