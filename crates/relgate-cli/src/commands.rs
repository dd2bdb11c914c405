//! Subcommand implementations. Each returns the text to print.

use crate::config::{AllowedStatus, ApprovalAction, Args, Command, HistoryAction, OutputFormat};
use crate::error::{CliError, CliResult};
use comfy_table::Table;
use relgate_core::approval::{
    check_issue_approved, skip_approval_step_if_needed, Approval, IamDirectory, IamPolicy,
    PrincipalType, User, WorkspaceRole,
};
use relgate_core::catalog::{DataSource, Database, InstanceUser};
use relgate_core::deployment::{build_database_matrix, DeploymentSchedule};
use relgate_core::engine::Engine;
use relgate_core::ghost::{GhostConfig, GhostMigrationContext, GhostRequest, GhostSettings};
use relgate_core::migration::{latest_schema_version, HistoryStore, MigrationError, SledHistoryStore};
use relgate_core::render::render_statement;
use relgate_core::task::{pass_all_check, Task, TaskCheckRun, TaskPayload};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Dispatch a parsed command line.
pub fn run(args: Args) -> CliResult<String> {
    match args.command {
        Command::Matrix {
            schedule,
            databases,
        } => matrix(&schedule, &databases, args.format),
        Command::Render { template, secrets } => render(&template, &secrets),
        Command::GhostConfig {
            request,
            server_id_offset,
            temp_dir,
        } => ghost_config(&request, GhostSettings::new(server_id_offset).with_temp_dir(temp_dir)),
        Command::Gate {
            task,
            runs,
            engine,
            allowed,
        } => gate(&task, &runs, &engine, allowed),
        Command::Approval { action } => match action {
            ApprovalAction::Check { issue } => approval_check(&issue),
            ApprovalAction::Skip {
                approval,
                users,
                policy,
            } => approval_skip(&approval, &users, &policy),
        },
        Command::History { action } => history(&args.data_path, action, args.format),
    }
}

fn read_text(path: &Path) -> CliResult<String> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let text = read_text(path)?;
    serde_json::from_str(&text).map_err(|source| CliError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn matrix(schedule: &Path, databases: &Path, format: OutputFormat) -> CliResult<String> {
    let schedule: DeploymentSchedule = read_json(schedule)?;
    let databases: Vec<Database> = read_json(databases)?;
    let matrix = build_database_matrix(&schedule, &databases);

    match format {
        OutputFormat::Json => {
            let stages: Vec<_> = schedule
                .deployments
                .iter()
                .zip(&matrix)
                .map(|(deployment, stage)| {
                    serde_json::json!({
                        "name": deployment.name,
                        "databases": stage.iter().map(|db| &db.name).collect::<Vec<_>>(),
                    })
                })
                .collect();
            Ok(serde_json::to_string_pretty(&stages)?)
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.set_header(vec!["Stage", "Databases"]);
            for (deployment, stage) in schedule.deployments.iter().zip(&matrix) {
                let names: Vec<&str> = stage.iter().map(|db| db.name.as_str()).collect();
                table.add_row(vec![deployment.name.clone(), names.join(", ")]);
            }
            Ok(table.to_string())
        }
    }
}

pub fn render(template: &Path, secrets: &Path) -> CliResult<String> {
    let template = read_text(template)?;
    let secrets: HashMap<String, String> = read_json(secrets)?;
    Ok(render_statement(&template, &secrets))
}

/// Request file for `ghost-config`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhostRequestFile {
    task_id: i64,
    database: Database,
    data_source: DataSource,
    #[serde(default)]
    password: String,
    #[serde(default)]
    instance_users: Vec<InstanceUser>,
    #[serde(default)]
    table_name: String,
    statement: String,
    #[serde(default)]
    noop: bool,
}

pub fn ghost_config(request: &Path, settings: GhostSettings) -> CliResult<String> {
    let file: GhostRequestFile = read_json(request)?;
    let request = GhostRequest {
        task_id: file.task_id,
        database: &file.database,
        data_source: &file.data_source,
        password: file.password.clone(),
        instance_users: &file.instance_users,
        table_name: file.table_name.clone(),
        statement: file.statement.clone(),
        noop: file.noop,
    };
    let config = GhostConfig::new(&request, &settings)?;
    let context = GhostMigrationContext::from_config(&config)?;
    Ok(serde_json::to_string_pretty(&context)?)
}

pub fn gate(task: &Path, runs: &Path, engine: &str, allowed: AllowedStatus) -> CliResult<String> {
    let task: Task = read_json(task)?;
    let runs: Vec<TaskCheckRun> = read_json(runs)?;
    let engine =
        Engine::parse(engine).ok_or_else(|| CliError::Argument(format!("unknown engine {engine:?}")))?;

    let raw = if task.payload.is_empty() { "{}" } else { task.payload.as_str() };
    let payload = TaskPayload::decode(task.task_type, raw)?;
    if let (true, reason) = payload.skipped() {
        return Ok(format!("task {} was skipped: {reason}", task.id));
    }

    let passed = pass_all_check(&task, allowed.into(), &runs, &engine)?;
    tracing::debug!(task_id = task.id, passed, "evaluated task checks");
    Ok(if passed {
        format!("task {} passed required checks", task.id)
    } else {
        format!("task {} is blocked by required checks", task.id)
    })
}

pub fn approval_check(issue: &Path) -> CliResult<String> {
    let payload = read_text(issue)?;
    Ok(if check_issue_approved(&payload)? {
        "approved".to_string()
    } else {
        "not approved".to_string()
    })
}

/// Users and policy loaded from files.
struct StaticDirectory {
    users: Vec<User>,
    policy: IamPolicy,
}

impl IamDirectory for StaticDirectory {
    fn list_users(
        &self,
        role: WorkspaceRole,
        _principal_type: PrincipalType,
        limit: usize,
    ) -> Result<Vec<User>, relgate_core::Error> {
        Ok(self
            .users
            .iter()
            .filter(|user| user.role == role)
            .take(limit)
            .cloned()
            .collect())
    }

    fn project_policy(&self, _project_id: i64) -> Result<IamPolicy, relgate_core::Error> {
        Ok(self.policy.clone())
    }
}

pub fn approval_skip(approval_path: &Path, users: &Path, policy: &Path) -> CliResult<String> {
    let mut approval: Approval = read_json(approval_path)?;
    let directory = StaticDirectory {
        users: read_json(users)?,
        policy: read_json(policy)?,
    };

    let skipped = skip_approval_step_if_needed(&directory, 0, &mut approval)?;
    if skipped > 0 {
        std::fs::write(approval_path, serde_json::to_string_pretty(&approval)?)?;
    }
    Ok(format!("skipped {skipped} approval step(s)"))
}

pub fn history(data_path: &Path, action: HistoryAction, format: OutputFormat) -> CliResult<String> {
    let db = sled::open(data_path)?;
    let store = SledHistoryStore::open(&db)?;

    match action {
        HistoryAction::List => {
            let records = store.list()?;
            match format {
                OutputFormat::Json => Ok(serde_json::to_string_pretty(&records)?),
                OutputFormat::Table => {
                    let mut table = Table::new();
                    table.set_header(vec![
                        "ID", "Instance", "Database", "Version", "Issue", "Type", "Status",
                        "Duration (ms)",
                    ]);
                    for record in &records {
                        table.add_row(vec![
                            record.id.to_string(),
                            record.instance_id.to_string(),
                            record.database_name.clone(),
                            record.version.clone(),
                            record.issue_id.clone(),
                            format!("{:?}", record.migration_type),
                            record.status.to_string(),
                            (record.execution_duration_ns / 1_000_000).to_string(),
                        ]);
                    }
                    Ok(table.to_string())
                }
            }
        }
        HistoryAction::Show { id } => {
            let record = store.get_record(id)?.ok_or(MigrationError::RecordNotFound(id))?;
            Ok(serde_json::to_string_pretty(&record)?)
        }
        HistoryAction::Latest { instance, database } => {
            Ok(latest_schema_version(&store, instance, database)?)
        }
    }
}
