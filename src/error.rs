//! Error types for cairn.
//!
//! A single unified error type [`CairnError`] covers every subsystem, along
//! with a convenient [`Result`] alias. Coordinator and scheduler code paths
//! log and absorb per-backup errors; only store initialization and top-level
//! startup are allowed to be fatal.

use std::io;
use thiserror::Error;

/// Main error type for cairn operations.
#[derive(Error, Debug)]
pub enum CairnError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Workflow engine error: {0}")]
    Workflow(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CairnError {
    /// Check if the error is transient and worth retrying on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CairnError::Network(_) | CairnError::Workflow(_))
    }
}

impl From<rusqlite::Error> for CairnError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CairnError::NotFound("no matching row".to_string())
            }
            other => CairnError::Storage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for CairnError {
    fn from(e: reqwest::Error) -> Self {
        CairnError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for CairnError {
    fn from(e: serde_json::Error) -> Self {
        CairnError::Serialization(e.to_string())
    }
}

/// Result type alias for cairn operations.
pub type Result<T> = std::result::Result<T, CairnError>;
