//! Assembling per-stage task lists into one pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plan assembly errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Task lists and dependency lists differ in length.
    #[error("expect task lists and dependency lists to have the same length, got {tasks} and {dags}")]
    LengthMismatch {
        /// Number of task lists.
        tasks: usize,
        /// Number of dependency lists.
        dags: usize,
    },
}

/// A dependency edge between two tasks, by index in their list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIndexDag {
    pub from_index: usize,
    pub to_index: usize,
}

/// Flatten per-stage task lists and re-base their dependency edges.
pub fn merge_task_create_lists<T>(
    task_lists: Vec<Vec<T>>,
    dag_lists: Vec<Vec<TaskIndexDag>>,
) -> Result<(Vec<T>, Vec<TaskIndexDag>), PlanError> {
    if task_lists.len() != dag_lists.len() {
        return Err(PlanError::LengthMismatch {
            tasks: task_lists.len(),
            dags: dag_lists.len(),
        });
    }

    let mut tasks = Vec::new();
    let mut dags = Vec::new();
    for (task_list, dag_list) in task_lists.into_iter().zip(dag_lists) {
        let offset = tasks.len();
        dags.extend(dag_list.into_iter().map(|dag| TaskIndexDag {
            from_index: dag.from_index + offset,
            to_index: dag.to_index + offset,
        }));
        tasks.extend(task_list);
    }
    Ok((tasks, dags))
}
