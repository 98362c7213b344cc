//! Error types for the container runtime

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Container already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Failed to launch image '{0}'")]
    LaunchFailed(String),

    #[error("Invalid state: container is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Malformed manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a manifest error for the given file
    pub fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error was caused by the slot table being full
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, Error::Capacity(_))
    }

    /// Check if this error means the request itself was malformed
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Manifest { .. })
    }
}
