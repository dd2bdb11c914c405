//! Command-line arguments.

use clap::{Parser, Subcommand, ValueEnum};
use relgate_core::task::TaskCheckStatus;
use std::path::PathBuf;

/// Default directory of the migration history store.
pub const DEFAULT_DATA_PATH: &str = "./data";

/// Default replication server id offset for online migrations.
pub const DEFAULT_SERVER_ID_OFFSET: u32 = 10_000_000;

/// RelGate command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "relgate")]
#[command(version, about = "Migration execution and release gating", long_about = None)]
pub struct Args {
    /// Path to the migration history store.
    #[arg(short, long, global = true, default_value = DEFAULT_DATA_PATH)]
    pub data_path: PathBuf,

    /// Output format
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

/// Minimum check outcome a gate accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AllowedStatus {
    Success,
    Warn,
    Error,
}

impl From<AllowedStatus> for TaskCheckStatus {
    fn from(status: AllowedStatus) -> Self {
        match status {
            AllowedStatus::Success => TaskCheckStatus::Success,
            AllowedStatus::Warn => TaskCheckStatus::Warn,
            AllowedStatus::Error => TaskCheckStatus::Error,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Assign databases to deployment stages.
    Matrix {
        /// Deployment schedule JSON.
        #[arg(long)]
        schedule: PathBuf,
        /// Database list JSON.
        #[arg(long)]
        databases: PathBuf,
    },

    /// Render secret placeholders in a SQL file.
    Render {
        /// SQL template file.
        template: PathBuf,
        /// JSON object of secret names to values.
        #[arg(long)]
        secrets: PathBuf,
    },

    /// Derive the online schema change context for a task.
    GhostConfig {
        /// Request JSON: task, database, data source and statement.
        request: PathBuf,
        /// Replication server id offset.
        #[arg(long, default_value_t = DEFAULT_SERVER_ID_OFFSET)]
        server_id_offset: u32,
        /// Directory for control sockets and postpone flags.
        #[arg(long, default_value = "/tmp")]
        temp_dir: PathBuf,
    },

    /// Check whether a task passed its required checks.
    Gate {
        /// Task JSON.
        #[arg(long)]
        task: PathBuf,
        /// Check runs JSON.
        #[arg(long)]
        runs: PathBuf,
        /// Engine of the task's instance.
        #[arg(long)]
        engine: String,
        /// Worst acceptable check outcome.
        #[arg(long, default_value = "success", value_enum)]
        allowed: AllowedStatus,
    },

    /// Inspect or advance an approval flow.
    Approval {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Query the migration history store.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ApprovalAction {
    /// Report whether an issue payload is fully approved.
    Check {
        /// Issue payload JSON.
        issue: PathBuf,
    },
    /// Skip steps nobody can approve and write the approval back.
    Skip {
        /// Approval JSON, updated in place.
        approval: PathBuf,
        /// Workspace users JSON.
        #[arg(long)]
        users: PathBuf,
        /// Project IAM policy JSON.
        #[arg(long)]
        policy: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum HistoryAction {
    /// List all migration records.
    List,
    /// Show one record.
    Show {
        id: u64,
    },
    /// Print the latest applied version.
    Latest {
        #[arg(long)]
        instance: i64,
        /// Omit for instance-level migrations.
        #[arg(long)]
        database: Option<i64>,
    },
}
