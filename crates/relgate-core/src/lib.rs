//! RelGate Core - migration execution and release gating.
//!
//! This crate decides whether a database change task may run and what it
//! runs with: deployment stages, required checks, approval workflows, online
//! schema change configuration, secret rendering and the migration history.

pub mod approval;
pub mod catalog;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod ghost;
pub mod migration;
pub mod render;
pub mod task;

pub use approval::{
    check_approval_approved, check_issue_approved, find_next_pending_step,
    skip_approval_step_if_needed, skip_unapprovable_steps, Approval, ApprovalError,
    ApprovalNode, ApprovalStep, ApprovalTemplate, Approver, EligibleApprovers, GroupValue,
    IamDirectory, IamPolicy,
};
pub use catalog::{
    DataSource, DataSourceType, Database, DatabaseCatalog, DatabaseId, Instance, InstanceId,
    InstanceUser, MemoryCatalog, SyncState,
};
pub use deployment::{
    active_stage, build_database_matrix, Deployment, DeploymentSchedule,
    LabelSelectorRequirement,
};
pub use engine::{Engine, EngineCapabilities};
pub use error::Error;
pub use ghost::{GhostConfig, GhostError, GhostMigrationContext, GhostRequest, GhostSettings};
pub use migration::{
    CancelToken, CoordinatorConfig, Driver, DriverError, HistoryStore, MigrationCoordinator,
    MigrationError, MigrationInfo, MigrationRecord, MigrationStatus, MigrationType,
    SledHistoryStore,
};
pub use render::{redact_secrets, render_statement};
pub use task::{pass_all_check, pass_check, Task, TaskCheckRun, TaskCheckStatus, TaskType};
