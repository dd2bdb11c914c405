//! Migration history records.

use super::error::{MigrationError, MigrationResult};
use crate::catalog::{DatabaseId, InstanceId};
use crate::error::current_timestamp;
use rkyv::{Archive, Deserialize, Serialize};

/// Migration record identifier.
pub type RecordId = u64;

/// Status of a migration record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    /// Migration started but not finished.
    Pending,
    /// Migration completed successfully.
    Done,
    /// Migration failed.
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "PENDING"),
            MigrationStatus::Done => write!(f, "DONE"),
            MigrationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Kind of migration.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    /// Record the live schema without executing anything.
    Baseline,
    /// Imperative schema change.
    Migrate,
    /// Declarative schema change.
    MigrateSdl,
    /// Data change.
    Data,
    /// Branch creation; always has an empty statement.
    Branch,
}

/// Identity of a migration: instance, optional database and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub instance_id: InstanceId,
    /// `None` for instance-level migrations.
    pub database_id: Option<DatabaseId>,
    pub version: String,
}

/// Describes one migration attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationInfo {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub database_id: Option<DatabaseId>,
    pub database_name: String,
    pub version: String,
    pub issue_id: String,
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    #[serde(default)]
    pub description: String,
    /// Reuse a pending or failed record instead of refusing.
    #[serde(default)]
    pub force: bool,
    /// The statement creates the database, so none is selected before running it.
    #[serde(default)]
    pub create_database: bool,
}

impl MigrationInfo {
    /// Create info for a database-level migration.
    pub fn new(
        instance_id: InstanceId,
        database_id: DatabaseId,
        database_name: impl Into<String>,
        version: impl Into<String>,
        issue_id: impl Into<String>,
        migration_type: MigrationType,
    ) -> Self {
        Self {
            instance_id,
            database_id: Some(database_id),
            database_name: database_name.into(),
            version: version.into(),
            issue_id: issue_id.into(),
            migration_type,
            description: String::new(),
            force: false,
            create_database: false,
        }
    }

    /// Set the force flag.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// The identity this attempt is recorded under.
    pub fn history_key(&self) -> HistoryKey {
        HistoryKey {
            instance_id: self.instance_id,
            database_id: self.database_id,
            version: self.version.clone(),
        }
    }
}

/// Terminal update applied when a migration attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    /// Completed; stores the resulting schema.
    Done { schema: String, duration_ns: u64 },
    /// Failed; stores the duration only.
    Failed { duration_ns: u64 },
}

/// Durable audit row for one migration attempt.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, serde::Serialize)]
pub struct MigrationRecord {
    pub id: RecordId,
    pub instance_id: InstanceId,
    pub database_id: Option<DatabaseId>,
    pub database_name: String,
    pub version: String,
    pub issue_id: String,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    /// Schema before the migration.
    pub prev_schema: String,
    /// Schema after the migration; empty until done.
    pub schema: String,
    /// Statement text, truncated to the configured maximum.
    pub statement: String,
    pub execution_duration_ns: u64,
    /// Microseconds since epoch.
    pub created_at: u64,
    /// Microseconds since epoch.
    pub updated_at: u64,
}

impl MigrationRecord {
    /// A fresh pending record.
    pub fn pending(id: RecordId, info: &MigrationInfo, prev_schema: &str, statement: &str) -> Self {
        let now = current_timestamp();
        Self {
            id,
            instance_id: info.instance_id,
            database_id: info.database_id,
            database_name: info.database_name.clone(),
            version: info.version.clone(),
            issue_id: info.issue_id.clone(),
            migration_type: info.migration_type,
            status: MigrationStatus::Pending,
            prev_schema: prev_schema.to_string(),
            schema: String::new(),
            statement: statement.to_string(),
            execution_duration_ns: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record reached Done or Failed.
    pub fn is_terminal(&self) -> bool {
        self.status != MigrationStatus::Pending
    }

    /// Apply a terminal update. Only pending records accept one.
    pub fn finish(&mut self, update: &RecordUpdate) -> MigrationResult<()> {
        if self.is_terminal() {
            return Err(MigrationError::RecordAlreadyFinalized {
                record_id: self.id,
                status: self.status,
            });
        }
        match update {
            RecordUpdate::Done { schema, duration_ns } => {
                self.status = MigrationStatus::Done;
                self.schema = schema.clone();
                self.execution_duration_ns = *duration_ns;
            }
            RecordUpdate::Failed { duration_ns } => {
                self.status = MigrationStatus::Failed;
                self.execution_duration_ns = *duration_ns;
            }
        }
        self.updated_at = current_timestamp();
        Ok(())
    }

    /// Return a failed record to pending for a forced retry.
    pub fn reopen(&mut self, prev_schema: &str, statement: &str) -> MigrationResult<()> {
        match self.status {
            MigrationStatus::Pending => Ok(()),
            MigrationStatus::Failed => {
                self.status = MigrationStatus::Pending;
                self.prev_schema = prev_schema.to_string();
                self.statement = statement.to_string();
                self.schema.clear();
                self.execution_duration_ns = 0;
                self.updated_at = current_timestamp();
                Ok(())
            }
            MigrationStatus::Done => Err(MigrationError::RecordAlreadyFinalized {
                record_id: self.id,
                status: self.status,
            }),
        }
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> MigrationResult<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> MigrationResult<Self> {
        // Stored values carry no alignment guarantee.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Truncate `statement` to at most `max` bytes on a character boundary.
pub fn truncate_statement(statement: &str, max: usize) -> &str {
    if statement.len() <= max {
        return statement;
    }
    let mut end = max;
    while !statement.is_char_boundary(end) {
        end -= 1;
    }
    &statement[..end]
}
