//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// An input file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An input file is not valid JSON for the expected shape.
    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Invalid argument value.
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Approval(#[from] relgate_core::ApprovalError),

    #[error(transparent)]
    Check(#[from] relgate_core::task::CheckError),

    #[error(transparent)]
    Payload(#[from] relgate_core::task::PayloadError),

    #[error(transparent)]
    Ghost(#[from] relgate_core::GhostError),

    #[error(transparent)]
    Migration(#[from] relgate_core::MigrationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;
