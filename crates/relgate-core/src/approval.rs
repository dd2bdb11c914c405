//! Multi-step approval workflow.
//!
//! A template is an ordered list of steps; each approver consumes exactly one
//! step, in order. Steps that nobody in the workspace or project could ever
//! approve are skipped automatically on behalf of the system bot.
//!
//! Mutating an [`Approval`] is not safe for concurrent callers. Apply skips
//! under a per-issue lock and persist right after each batch.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Principal id recorded for steps approved by the system.
pub const SYSTEM_BOT_ID: i64 = 1;

/// Approval workflow errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The approval or template does not have the supported shape.
    #[error("approval shape error: {0}")]
    Shape(String),

    /// Looking up users or policies failed.
    #[error("directory error: {0}")]
    Directory(#[from] crate::error::Error),

    /// The issue payload could not be decoded.
    #[error("failed to decode issue payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for approval operations.
pub type ApprovalResult<T> = Result<T, ApprovalError>;

/// How the nodes of a step combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    #[default]
    TypeUnspecified,
    /// Any one node may approve.
    Any,
}

/// How principals are drawn for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    #[default]
    TypeUnspecified,
    /// Any member of the group approves.
    AnyInGroup,
}

/// Well-known approver groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupValue {
    GroupValueUnspecified,
    WorkspaceOwner,
    WorkspaceDba,
    ProjectOwner,
    ProjectMember,
}

/// Who may satisfy a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodePayload {
    /// A well-known group.
    GroupValue(GroupValue),
    /// A project role name such as `roles/QA`.
    Role(String),
}

/// One node of an approval step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalNode {
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    pub payload: NodePayload,
}

impl ApprovalNode {
    /// Node satisfied by any member of `group`.
    pub fn group(group: GroupValue) -> Self {
        Self {
            node_type: NodeType::AnyInGroup,
            payload: NodePayload::GroupValue(group),
        }
    }

    /// Node satisfied by any holder of the project role.
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            node_type: NodeType::AnyInGroup,
            payload: NodePayload::Role(role.into()),
        }
    }
}

/// One step of an approval flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    #[serde(default)]
    pub nodes: Vec<ApprovalNode>,
}

impl ApprovalStep {
    /// Single-node step of type ANY.
    pub fn any(node: ApprovalNode) -> Self {
        Self {
            step_type: StepType::Any,
            nodes: vec![node],
        }
    }
}

/// An ordered approval flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTemplate {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub steps: Vec<ApprovalStep>,
}

/// Decision recorded by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverStatus {
    Pending,
    Approved,
    Rejected,
}

/// A principal who acted on one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approver {
    pub status: ApproverStatus,
    pub principal_id: i64,
}

/// Approval state of an issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    #[serde(default)]
    pub approval_finding_done: bool,
    #[serde(default)]
    pub approval_finding_error: String,
    #[serde(default)]
    pub approval_templates: Vec<ApprovalTemplate>,
    #[serde(default)]
    pub approvers: Vec<Approver>,
}

/// The part of an issue payload this crate reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssuePayload {
    #[serde(default)]
    pub approval: Option<Approval>,
}

/// The step the next approver must satisfy, if any remain.
pub fn find_next_pending_step<'a>(
    template: &'a ApprovalTemplate,
    approvers: &[Approver],
) -> Option<&'a ApprovalStep> {
    template.steps.get(approvers.len())
}

fn single_template(approval: &Approval) -> ApprovalResult<&ApprovalTemplate> {
    match approval.approval_templates.as_slice() {
        [template] => Ok(template),
        templates => Err(ApprovalError::Shape(format!(
            "expecting one approval template but got {}",
            templates.len()
        ))),
    }
}

/// Whether an approval has been fully granted.
pub fn check_approval_approved(approval: Option<&Approval>) -> ApprovalResult<bool> {
    let Some(approval) = approval else {
        return Ok(false);
    };
    if !approval.approval_finding_done || !approval.approval_finding_error.is_empty() {
        return Ok(false);
    }
    if approval.approval_templates.is_empty() {
        return Ok(true);
    }
    let template = single_template(approval)?;
    Ok(find_next_pending_step(template, &approval.approvers).is_none())
}

/// Decode an issue payload and check its approval.
pub fn check_issue_approved(payload: &str) -> ApprovalResult<bool> {
    let payload: IssuePayload = serde_json::from_str(payload)?;
    check_approval_approved(payload.approval.as_ref())
}

/// Workspace roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkspaceRole {
    Owner,
    Dba,
    Developer,
}

impl WorkspaceRole {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceRole::Owner => "OWNER",
            WorkspaceRole::Dba => "DBA",
            WorkspaceRole::Developer => "DEVELOPER",
        }
    }

    /// Name of the role in a project IAM policy.
    pub fn role_name(&self) -> String {
        format!("roles/{}", self.as_str())
    }
}

/// Kind of principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrincipalType {
    EndUser,
    ServiceAccount,
    SystemBot,
}

/// A workspace user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub role: WorkspaceRole,
}

/// A role binding in a project policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// A project's IAM policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamPolicy {
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// Source of users and project policies.
pub trait IamDirectory {
    /// Users holding `role`, at most `limit` of them.
    fn list_users(
        &self,
        role: WorkspaceRole,
        principal_type: PrincipalType,
        limit: usize,
    ) -> Result<Vec<User>, crate::error::Error>;

    /// IAM policy of a project.
    fn project_policy(&self, project_id: i64) -> Result<IamPolicy, crate::error::Error>;
}

/// Who could approve, at workspace and project level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibleApprovers {
    pub workspace_owner: bool,
    pub workspace_dba: bool,
    /// Project roles that have at least one member.
    pub project_roles: HashSet<String>,
}

impl EligibleApprovers {
    /// Compute eligibility from users and a project policy.
    pub fn from_parts(users: &[User], policy: &IamPolicy) -> Self {
        Self {
            workspace_owner: users.iter().any(|u| u.role == WorkspaceRole::Owner),
            workspace_dba: users.iter().any(|u| u.role == WorkspaceRole::Dba),
            project_roles: policy
                .bindings
                .iter()
                .filter(|binding| !binding.members.is_empty())
                .map(|binding| binding.role.clone())
                .collect(),
        }
    }

    /// Query the directory for eligibility.
    pub fn resolve(directory: &dyn IamDirectory, project_id: i64) -> ApprovalResult<Self> {
        let policy = directory.project_policy(project_id)?;
        let mut users = Vec::new();
        for role in [WorkspaceRole::Owner, WorkspaceRole::Dba] {
            users.extend(directory.list_users(role, PrincipalType::EndUser, 1)?);
        }
        Ok(Self::from_parts(&users, &policy))
    }

    fn has_project_role(&self, role: &str) -> bool {
        self.project_roles.contains(role)
    }

    /// Whether anyone could approve `step`.
    pub fn can_approve(&self, step: &ApprovalStep) -> ApprovalResult<bool> {
        let [node] = step.nodes.as_slice() else {
            return Err(ApprovalError::Shape(format!(
                "expecting one node but got {}",
                step.nodes.len()
            )));
        };
        if step.step_type != StepType::Any {
            return Err(ApprovalError::Shape(format!(
                "expecting ANY step type but got {:?}",
                step.step_type
            )));
        }
        if node.node_type != NodeType::AnyInGroup {
            return Err(ApprovalError::Shape(format!(
                "expecting ANY_IN_GROUP node type but got {:?}",
                node.node_type
            )));
        }

        match &node.payload {
            NodePayload::GroupValue(group) => match group {
                GroupValue::GroupValueUnspecified => {
                    Err(ApprovalError::Shape("invalid group value".to_string()))
                }
                GroupValue::WorkspaceOwner => Ok(self.workspace_owner),
                GroupValue::WorkspaceDba => Ok(self.workspace_dba),
                GroupValue::ProjectOwner => {
                    Ok(self.has_project_role(&WorkspaceRole::Owner.role_name()))
                }
                GroupValue::ProjectMember => {
                    Ok(self.has_project_role(&WorkspaceRole::Developer.role_name()))
                }
            },
            NodePayload::Role(role) => Ok(self.has_project_role(role)),
        }
    }
}

/// Auto-approve leading pending steps that nobody could approve.
///
/// Stops at the first step with an eligible approver or when the template is
/// exhausted. Returns the number of steps skipped; the caller persists
/// `approval`.
pub fn skip_unapprovable_steps(
    approval: &mut Approval,
    eligible: &EligibleApprovers,
) -> ApprovalResult<usize> {
    if approval.approval_templates.is_empty() {
        return Ok(0);
    }
    let template = single_template(approval)?.clone();

    let mut skipped = 0;
    while let Some(step) = find_next_pending_step(&template, &approval.approvers) {
        if eligible.can_approve(step)? {
            break;
        }
        skipped += 1;
        approval.approvers.push(Approver {
            status: ApproverStatus::Approved,
            principal_id: SYSTEM_BOT_ID,
        });
    }

    if skipped > 0 {
        tracing::info!(
            skipped,
            approvers = approval.approvers.len(),
            steps = template.steps.len(),
            "skipped approval steps without eligible approvers"
        );
    }
    Ok(skipped)
}

/// Resolve eligibility for a project and skip unapprovable steps.
pub fn skip_approval_step_if_needed(
    directory: &dyn IamDirectory,
    project_id: i64,
    approval: &mut Approval,
) -> ApprovalResult<usize> {
    if approval.approval_templates.is_empty() {
        return Ok(0);
    }
    let eligible = EligibleApprovers::resolve(directory, project_id)?;
    skip_unapprovable_steps(approval, &eligible)
}
