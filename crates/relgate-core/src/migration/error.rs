//! Migration-specific error types.

use super::driver::DriverError;
use super::record::{MigrationStatus, RecordId};
use crate::catalog::DatabaseId;
use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Another issue already applied this version.
    #[error("database {database:?} has already applied version {version} by issue {issue_id}")]
    ConflictingVersionApplied {
        /// The existing record.
        record_id: RecordId,
        /// Database name.
        database: String,
        /// Version being applied.
        version: String,
        /// Issue that applied it.
        issue_id: String,
    },

    /// This issue already applied this version. Callers treat it as success.
    #[error("database {database:?} has already applied version {version}")]
    DuplicateVersionApplied {
        /// The existing record.
        record_id: RecordId,
        /// Database name.
        database: String,
        /// Version being applied.
        version: String,
    },

    /// A pending record exists for this version.
    #[error("database {database:?} version {version} migration is already in progress")]
    MigrationInProgress {
        /// The pending record.
        record_id: RecordId,
        /// Database name.
        database: String,
        /// Version being applied.
        version: String,
    },

    /// A failed record exists for this version.
    #[error(
        "database {database:?} version {version} migration has failed, check the database \
         and then start a new migration using a new version"
    )]
    MigrationPreviouslyFailed {
        /// The failed record.
        record_id: RecordId,
        /// Database name.
        database: String,
        /// Version being applied.
        version: String,
    },

    /// The store refused to create a second record for a version.
    #[error("version {version} is already recorded as migration {record_id}")]
    VersionSlotTaken {
        /// The record holding the version.
        record_id: RecordId,
        /// Version being applied.
        version: String,
    },

    /// The target database does not exist in the catalog.
    #[error("database {0} not found")]
    DatabaseNotFound(DatabaseId),

    /// Migration record not found.
    #[error("migration record {0} not found")]
    RecordNotFound(RecordId),

    /// The record already reached a terminal status.
    #[error("migration record {record_id} is already {status}")]
    RecordAlreadyFinalized {
        /// The record.
        record_id: RecordId,
        /// Its terminal status.
        status: MigrationStatus,
    },

    /// Dump or execution failed in the driver.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Whether re-running with `force` set may succeed.
    pub fn is_retryable_with_force(&self) -> bool {
        matches!(
            self,
            MigrationError::MigrationInProgress { .. }
                | MigrationError::MigrationPreviouslyFailed { .. }
        )
    }

    /// Whether the attempt must not be retried as-is.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::ConflictingVersionApplied { .. }
                | MigrationError::DatabaseNotFound(_)
                | MigrationError::RecordAlreadyFinalized { .. }
        )
    }
}

/// Result type for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

impl From<sled::Error> for MigrationError {
    fn from(e: sled::Error) -> Self {
        MigrationError::Storage(crate::error::Error::Storage(e))
    }
}
