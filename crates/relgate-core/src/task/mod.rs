//! Tasks: required pre-condition checks, payloads and plan assembly.

pub mod check;
pub mod payload;
pub mod plan;

pub use check::{
    pass_all_check, pass_check, CheckError, CheckResult, TaskCheckResult, TaskCheckRun,
    TaskCheckRunResultPayload, TaskCheckRunStatus, TaskCheckStatus, TaskCheckType,
};
pub use payload::{PayloadError, TaskPayload, UpdatePayload};
pub use plan::{merge_task_create_lists, PlanError, TaskIndexDag};

use serde::{Deserialize, Serialize};

/// Task identifier.
pub type TaskId = i64;

/// Kinds of pipeline task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "bb.task.general")]
    General,
    #[serde(rename = "bb.task.database.create")]
    DatabaseCreate,
    #[serde(rename = "bb.task.database.schema.baseline")]
    SchemaBaseline,
    #[serde(rename = "bb.task.database.schema.update")]
    SchemaUpdate,
    #[serde(rename = "bb.task.database.schema.update-sdl")]
    SchemaUpdateSdl,
    #[serde(rename = "bb.task.database.schema.update.ghost.sync")]
    SchemaUpdateGhostSync,
    #[serde(rename = "bb.task.database.schema.update.ghost.cutover")]
    SchemaUpdateGhostCutover,
    #[serde(rename = "bb.task.database.data.update")]
    DataUpdate,
}

impl TaskType {
    /// Whether the task changes schema or data and therefore must pass checks.
    pub fn is_update(&self) -> bool {
        matches!(
            self,
            TaskType::SchemaUpdate
                | TaskType::SchemaUpdateSdl
                | TaskType::DataUpdate
                | TaskType::SchemaUpdateGhostSync
        )
    }
}

/// A pipeline task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub database_id: Option<i64>,
    /// Raw JSON payload; decode with [`TaskPayload::decode`].
    #[serde(default)]
    pub payload: String,
}
