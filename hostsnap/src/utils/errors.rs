//! Custom error types for hostsnap.

use thiserror::Error;

use crate::pipeline::PipelineError;

#[derive(Error, Debug)]
pub enum SnapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State error for '{archive}': {message}")]
    State { archive: String, message: String },

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl SnapError {
    pub fn state(archive: &str, message: impl Into<String>) -> Self {
        SnapError::State {
            archive: archive.to_string(),
            message: message.into(),
        }
    }
}

impl From<::config::ConfigError> for SnapError {
    fn from(err: ::config::ConfigError) -> Self {
        SnapError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SnapError>;
