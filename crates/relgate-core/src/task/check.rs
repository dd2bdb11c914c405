//! Task check gate.
//!
//! A task may only advance when the latest run of every required check type
//! finished and none of its results is worse than the allowed status. The
//! `PendingApproval -> Pending` transition requires `Success`; the
//! `Pending -> Running` transition tolerates `Warn`.

use super::{Task, TaskId, TaskType};
use crate::engine::EngineCapabilities;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Task check errors.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The result payload of a check run could not be decoded.
    #[error("failed to decode result of check run {run_id}: {source}")]
    Decode {
        /// The check run id.
        run_id: i64,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for check evaluation.
pub type CheckResult<T> = Result<T, CheckError>;

/// Kinds of required check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskCheckType {
    #[serde(rename = "bb.task-check.database.connect")]
    DatabaseConnect,
    #[serde(rename = "bb.task-check.database.statement.syntax")]
    StatementSyntax,
    #[serde(rename = "bb.task-check.database.statement.advise")]
    StatementAdvise,
    #[serde(rename = "bb.task-check.database.statement.type")]
    StatementType,
    #[serde(rename = "bb.task-check.database.ghost.sync")]
    GhostSync,
}

/// Lifecycle of a check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCheckRunStatus {
    Running,
    Done,
    Failed,
    Canceled,
}

/// Outcome of a single check result, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCheckStatus {
    Error,
    Warn,
    Success,
}

impl std::fmt::Display for TaskCheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskCheckStatus::Error => write!(f, "ERROR"),
            TaskCheckStatus::Warn => write!(f, "WARN"),
            TaskCheckStatus::Success => write!(f, "SUCCESS"),
        }
    }
}

/// One recorded run of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCheckRun {
    pub id: i64,
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub check_type: TaskCheckType,
    pub status: TaskCheckRunStatus,
    /// JSON encoded [`TaskCheckRunResultPayload`].
    #[serde(default)]
    pub result: String,
}

/// A sub-result of a check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCheckResult {
    pub status: TaskCheckStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub content: String,
}

/// Decoded result of a check run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCheckRunResultPayload {
    #[serde(default)]
    pub result_list: Vec<TaskCheckResult>,
}

/// Whether the latest run of `check_type` passed at `allowed` level.
///
/// The latest run is the one with the highest id, regardless of list order.
pub fn pass_check(
    runs: &[&TaskCheckRun],
    check_type: TaskCheckType,
    allowed: TaskCheckStatus,
) -> CheckResult<bool> {
    let latest = runs
        .iter()
        .filter(|run| run.check_type == check_type)
        .max_by_key(|run| run.id);

    let Some(latest) = latest else {
        return Ok(false);
    };
    if latest.status != TaskCheckRunStatus::Done {
        return Ok(false);
    }

    let payload: TaskCheckRunResultPayload =
        serde_json::from_str(&latest.result).map_err(|source| CheckError::Decode {
            run_id: latest.id,
            source,
        })?;
    Ok(payload.result_list.iter().all(|result| result.status >= allowed))
}

/// Whether `task` has passed every check required for its type and engine.
pub fn pass_all_check(
    task: &Task,
    allowed: TaskCheckStatus,
    all_runs: &[TaskCheckRun],
    engine: &dyn EngineCapabilities,
) -> CheckResult<bool> {
    let runs: Vec<&TaskCheckRun> = all_runs.iter().filter(|run| run.task_id == task.id).collect();

    let mut required = Vec::new();
    if task.task_type.is_update() {
        required.push(TaskCheckType::DatabaseConnect);
        if engine.supports_syntax_check() {
            required.push(TaskCheckType::StatementSyntax);
        }
        if engine.supports_review() {
            required.push(TaskCheckType::StatementAdvise);
        }
        if engine.requires_statement_type_check() {
            required.push(TaskCheckType::StatementType);
        }
    }
    if task.task_type == TaskType::SchemaUpdateGhostSync {
        required.push(TaskCheckType::GhostSync);
    }

    for check_type in required {
        if !pass_check(&runs, check_type, allowed)? {
            tracing::debug!(task_id = task.id, ?check_type, %allowed, "task check not passed");
            return Ok(false);
        }
    }
    Ok(true)
}
