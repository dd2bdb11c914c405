//! Staged rollout: assigning databases to deployment stages by label selector.

use crate::catalog::{Database, DatabaseId, SyncState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Operator of a label selector requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOperator {
    /// Label is present and its value is in the allowed set.
    In,
    /// Label key is present.
    Exists,
    /// Any operator this crate does not understand. Never matches.
    #[serde(other)]
    Unsupported,
}

/// A single label condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    /// `key In (values...)`.
    pub fn is_in(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            operator: LabelOperator::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `key Exists`.
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: LabelOperator::Exists,
            values: Vec::new(),
        }
    }

    /// Evaluate this requirement against a label map.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            LabelOperator::In => labels
                .get(&self.key)
                .is_some_and(|value| self.values.iter().any(|allowed| allowed == value)),
            LabelOperator::Exists => labels.contains_key(&self.key),
            LabelOperator::Unsupported => false,
        }
    }
}

/// Returns true iff `expressions` is non-empty and every expression matches.
///
/// An empty list matches nothing so a stage cannot become a catch-all by accident.
pub fn matches_all(labels: &BTreeMap<String, String>, expressions: &[LabelSelectorRequirement]) -> bool {
    !expressions.is_empty() && expressions.iter().all(|expr| expr.matches(labels))
}

/// One stage of a deployment schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl Deployment {
    /// Create a stage with the given selector.
    pub fn new(name: impl Into<String>, match_expressions: Vec<LabelSelectorRequirement>) -> Self {
        Self {
            name: name.into(),
            match_expressions,
        }
    }
}

/// Ordered deployment stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSchedule {
    pub deployments: Vec<Deployment>,
}

/// Assign databases to stages.
///
/// Each database lands in the first stage whose selector it satisfies, or
/// nowhere. Databases whose sync state is `NotFound` are never placed. The
/// result has one entry per stage, in schedule order, each sorted by id.
pub fn build_database_matrix<'a>(
    schedule: &DeploymentSchedule,
    databases: &'a [Database],
) -> Vec<Vec<&'a Database>> {
    let mut claimed: HashSet<DatabaseId> = HashSet::new();
    let mut matrix = Vec::with_capacity(schedule.deployments.len());

    for deployment in &schedule.deployments {
        let mut stage: Vec<&Database> = Vec::new();
        for database in databases {
            if claimed.contains(&database.id) || database.sync_state == SyncState::NotFound {
                continue;
            }
            if matches_all(&database.labels, &deployment.match_expressions) {
                claimed.insert(database.id);
                stage.push(database);
            }
        }
        stage.sort_by_key(|database| database.id);
        matrix.push(stage);
    }

    tracing::debug!(
        stages = matrix.len(),
        placed = claimed.len(),
        databases = databases.len(),
        "built deployment matrix"
    );
    matrix
}

/// A pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub name: String,
    pub active: bool,
}

/// First active stage, if any.
pub fn active_stage(stages: &[Stage]) -> Option<&Stage> {
    stages.iter().find(|stage| stage.active)
}
