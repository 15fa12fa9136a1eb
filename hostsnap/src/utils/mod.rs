//! Utility modules for hostsnap.

pub mod errors;
pub mod logger;

pub use errors::{Result, SnapError};
