//! Typed task payloads.

use super::TaskType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload decoding errors.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload is not valid JSON for the task type.
    #[error("failed to decode payload for {task_type:?}: {source}")]
    Decode {
        /// The task type being decoded.
        task_type: TaskType,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The payload decoded but violates a constraint.
    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Payload of schema, data and online schema update tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    #[serde(default)]
    pub sheet_id: i64,
    #[serde(default)]
    pub statement: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub skipped_reason: String,
}

/// Payload of database creation tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatabasePayload {
    pub database_name: String,
    #[serde(default)]
    pub statement: String,
    #[serde(default)]
    pub character_set: String,
    #[serde(default)]
    pub collation: String,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub skipped_reason: String,
}

/// Fields every task payload carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonPayload {
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub skipped_reason: String,
}

/// A task payload decoded according to its task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    SchemaUpdate(UpdatePayload),
    DataUpdate(UpdatePayload),
    GhostSync(UpdatePayload),
    DatabaseCreate(CreateDatabasePayload),
    Other(CommonPayload),
}

fn decode<T: serde::de::DeserializeOwned>(task_type: TaskType, raw: &str) -> Result<T, PayloadError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|source| PayloadError::Decode { task_type, source })?;
    // Sequences would otherwise fill the fields positionally.
    if !value.is_object() {
        return Err(PayloadError::Invalid(format!(
            "{task_type:?} payload must be a JSON object"
        )));
    }
    serde_json::from_value(value).map_err(|source| PayloadError::Decode { task_type, source })
}

impl TaskPayload {
    /// Decode and validate `raw` for `task_type`.
    pub fn decode(task_type: TaskType, raw: &str) -> Result<Self, PayloadError> {
        let payload = match task_type {
            TaskType::SchemaUpdate | TaskType::SchemaUpdateSdl => {
                TaskPayload::SchemaUpdate(decode(task_type, raw)?)
            }
            TaskType::DataUpdate => TaskPayload::DataUpdate(decode(task_type, raw)?),
            TaskType::SchemaUpdateGhostSync => TaskPayload::GhostSync(decode(task_type, raw)?),
            TaskType::DatabaseCreate => TaskPayload::DatabaseCreate(decode(task_type, raw)?),
            TaskType::General | TaskType::SchemaBaseline | TaskType::SchemaUpdateGhostCutover => {
                TaskPayload::Other(decode(task_type, raw)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), PayloadError> {
        match self {
            TaskPayload::SchemaUpdate(p) | TaskPayload::DataUpdate(p) | TaskPayload::GhostSync(p) => {
                if p.sheet_id < 0 {
                    return Err(PayloadError::Invalid(format!("negative sheet id {}", p.sheet_id)));
                }
                Ok(())
            }
            TaskPayload::DatabaseCreate(p) if p.database_name.is_empty() => Err(
                PayloadError::Invalid("database creation requires a database name".to_string()),
            ),
            TaskPayload::DatabaseCreate(_) | TaskPayload::Other(_) => Ok(()),
        }
    }

    /// Inline statement, if the task type carries one.
    pub fn statement(&self) -> Option<&str> {
        match self {
            TaskPayload::SchemaUpdate(p) | TaskPayload::DataUpdate(p) | TaskPayload::GhostSync(p) => {
                Some(p.statement.as_str())
            }
            TaskPayload::DatabaseCreate(p) => Some(p.statement.as_str()),
            TaskPayload::Other(_) => None,
        }
    }

    /// Sheet holding the statement, if one is referenced.
    pub fn sheet_id(&self) -> Option<i64> {
        match self {
            TaskPayload::SchemaUpdate(p) | TaskPayload::DataUpdate(p) | TaskPayload::GhostSync(p)
                if p.sheet_id > 0 =>
            {
                Some(p.sheet_id)
            }
            _ => None,
        }
    }

    /// Whether the task was skipped, and why.
    pub fn skipped(&self) -> (bool, &str) {
        match self {
            TaskPayload::SchemaUpdate(p) | TaskPayload::DataUpdate(p) | TaskPayload::GhostSync(p) => {
                (p.skipped, p.skipped_reason.as_str())
            }
            TaskPayload::DatabaseCreate(p) => (p.skipped, p.skipped_reason.as_str()),
            TaskPayload::Other(p) => (p.skipped, p.skipped_reason.as_str()),
        }
    }
}
