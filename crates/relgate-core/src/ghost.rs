//! Configuration for the gh-ost online schema change engine.
//!
//! This module derives a fully populated [`GhostMigrationContext`] from task
//! and catalog facts. The row copy and cut-over themselves run inside the
//! external engine.

use crate::catalog::{Database, DatabaseId, DataSource, InstanceUser};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Default MySQL port used when the data source leaves it empty.
pub const DEFAULT_PORT: u16 = 3306;

/// Operational defaults applied to every online migration.
pub mod defaults {
    pub const ALLOWED_RUNNING_ON_MASTER: bool = true;
    pub const CONCURRENT_COUNT_TABLE_ROWS: bool = true;
    pub const TIMESTAMP_ALL_TABLE: bool = true;
    pub const HOOKS_STATUS_INTERVAL_SEC: u64 = 60;
    pub const HEARTBEAT_INTERVAL_MILLIS: u64 = 100;
    pub const NICE_RATIO: f64 = 0.0;
    pub const CHUNK_SIZE: u64 = 1000;
    pub const DML_BATCH_SIZE: u64 = 10;
    pub const MAX_LAG_MILLIS_THROTTLE_THRESHOLD: u64 = 1500;
    pub const DEFAULT_NUM_RETRIES: u64 = 60;
    pub const CUT_OVER_LOCK_TIMEOUT_SECONDS: u64 = 3;
    pub const EXPONENTIAL_BACKOFF_MAX_INTERVAL: u64 = 64;
    pub const THROTTLE_HTTP_INTERVAL_MILLIS: u64 = 100;
    pub const THROTTLE_HTTP_TIMEOUT_MILLIS: u64 = 1000;
}

/// Online migration configuration errors.
#[derive(Debug, Error)]
pub enum GhostError {
    /// The database or table target cannot be resolved.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The data source port is not a number.
    #[error("invalid port {port:?}: {reason}")]
    InvalidPort {
        /// The configured port text.
        port: String,
        /// Parse failure.
        reason: String,
    },

    /// The replication server id falls outside 1..=2^32-1.
    #[error("replication server id {0} is out of range")]
    ServerIdOutOfRange(u64),

    /// An operational option is outside the range the engine accepts.
    #[error("invalid option {name}: {value}")]
    InvalidOption {
        /// Option name.
        name: &'static str,
        /// Rejected value.
        value: u64,
    },
}

/// Result type for online migration configuration.
pub type GhostResult<T> = Result<T, GhostError>;

/// Process-wide settings for online migrations.
#[derive(Debug, Clone)]
pub struct GhostSettings {
    /// Added to the task id to form the replication server id. Must keep this
    /// process's ids disjoint from every other replication client.
    pub server_id_offset: u32,
    /// Directory holding control sockets and postpone-flag files.
    pub temp_dir: PathBuf,
}

impl GhostSettings {
    /// Create settings with the given server id offset.
    pub fn new(server_id_offset: u32) -> Self {
        Self {
            server_id_offset,
            temp_dir: PathBuf::from("/tmp"),
        }
    }

    /// Set the directory for socket and flag files.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}

impl Default for GhostSettings {
    fn default() -> Self {
        Self::new(10_000_000)
    }
}

/// Control socket path for a task's online migration.
pub fn socket_path(dir: &Path, task_id: i64, database_id: DatabaseId, database: &str, table: &str) -> PathBuf {
    dir.join(format!("gh-ost.{task_id}.{database_id}.{database}.{table}.sock"))
}

/// Postpone-cutover flag path. Operators remove this file to release cut-over.
pub fn postpone_flag_path(dir: &Path, task_id: i64, database_id: DatabaseId, database: &str, table: &str) -> PathBuf {
    dir.join(format!("gh-ost.{task_id}.{database_id}.{database}.{table}.postponeFlag"))
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn normalize_statement(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}

static EXPLICIT_SCHEMA_TABLE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // ALTER TABLE `scm`.`tbl` something
        r"(?i)\balter\s+table\s+`([^`]+)`[.]`([^`]+)`\s+(.*$)",
        // ALTER TABLE `scm`.tbl something
        r"(?i)\balter\s+table\s+`([^`]+)`[.](\S+)\s+(.*$)",
        // ALTER TABLE scm.`tbl` something
        r"(?i)\balter\s+table\s+(\S+)[.]`([^`]+)`\s+(.*$)",
        // ALTER TABLE scm.tbl something
        r"(?i)\balter\s+table\s+(\S+)[.](\S+)\s+(.*$)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

static EXPLICIT_TABLE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // ALTER TABLE `tbl` something
        r"(?i)\balter\s+table\s+`([^`]+)`\s+(.*$)",
        // ALTER TABLE tbl something
        r"(?i)\balter\s+table\s+(\S+)\s+(.*$)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

/// The parts of an `ALTER TABLE` statement the online engine needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlterTarget {
    pub schema: Option<String>,
    pub table: Option<String>,
    /// Everything after the table name, or the whole statement if unparsed.
    pub options: String,
}

impl AlterTarget {
    /// Parse a whitespace-normalized alter statement.
    pub fn parse(statement: &str) -> Self {
        for re in EXPLICIT_SCHEMA_TABLE.iter() {
            if let Some(caps) = re.captures(statement) {
                return Self {
                    schema: Some(caps[1].to_string()),
                    table: Some(caps[2].to_string()),
                    options: caps[3].to_string(),
                };
            }
        }
        for re in EXPLICIT_TABLE.iter() {
            if let Some(caps) = re.captures(statement) {
                return Self {
                    schema: None,
                    table: Some(caps[1].to_string()),
                    options: caps[2].to_string(),
                };
            }
        }
        Self {
            schema: None,
            table: None,
            options: statement.to_string(),
        }
    }
}

/// Table name targeted by an `ALTER TABLE` statement.
pub fn table_name_from_statement(statement: &str) -> GhostResult<String> {
    let statement = normalize_statement(statement);
    AlterTarget::parse(&statement).table.ok_or_else(|| {
        GhostError::Configuration(format!(
            "failed to parse table name from statement, statement: {statement}"
        ))
    })
}

/// Facts needed to configure one online migration.
#[derive(Debug, Clone)]
pub struct GhostRequest<'a> {
    pub task_id: i64,
    pub database: &'a Database,
    pub data_source: &'a DataSource,
    /// Decrypted password for the data source user.
    pub password: String,
    pub instance_users: &'a [InstanceUser],
    /// Resolved table name; may be empty if the statement names it.
    pub table_name: String,
    pub statement: String,
    pub noop: bool,
}

/// Connection and identity settings for one online migration.
#[derive(Debug, Clone)]
pub struct GhostConfig {
    pub server_id: u32,
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table: String,
    pub alter_statement: String,
    pub socket_path: PathBuf,
    pub postpone_flag_path: PathBuf,
    pub noop: bool,
    /// Running against AWS RDS.
    pub is_aws: bool,
}

/// Whether the instance users reveal an AWS RDS topology.
pub fn is_aws_rds(users: &[InstanceUser]) -> bool {
    users
        .iter()
        .any(|user| user.name == "'rdsadmin'@'localhost'" && user.grant.contains("SUPER"))
}

impl GhostConfig {
    /// Derive the configuration for a task.
    pub fn new(request: &GhostRequest<'_>, settings: &GhostSettings) -> GhostResult<Self> {
        let server_id = u64::from(settings.server_id_offset)
            .checked_add_signed(request.task_id)
            .filter(|id| (1..=u64::from(u32::MAX)).contains(id))
            .ok_or_else(|| {
                GhostError::ServerIdOutOfRange(
                    (i128::from(settings.server_id_offset) + i128::from(request.task_id)).max(0) as u64,
                )
            })?;
        let database = request.database;

        Ok(Self {
            server_id: server_id as u32,
            host: request.data_source.host.clone(),
            port: request.data_source.port.clone(),
            user: request.data_source.username.clone(),
            password: request.password.clone(),
            database: database.name.clone(),
            table: request.table_name.clone(),
            alter_statement: request.statement.clone(),
            socket_path: socket_path(
                &settings.temp_dir,
                request.task_id,
                database.id,
                &database.name,
                &request.table_name,
            ),
            postpone_flag_path: postpone_flag_path(
                &settings.temp_dir,
                request.task_id,
                database.id,
                &database.name,
                &request.table_name,
            ),
            noop: request.noop,
            is_aws: is_aws_rds(request.instance_users),
        })
    }
}

/// Cut-over strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutOverType {
    Atomic,
    TwoStep,
}

/// Everything the online engine needs to run a migration.
#[derive(Debug, Clone, Serialize)]
pub struct GhostMigrationContext {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database_name: String,
    pub original_table_name: String,
    pub alter_statement: String,
    pub alter_statement_options: String,
    pub noop: bool,
    pub replica_server_id: u32,
    /// Assume row-based replication; RDS hides binlog format introspection.
    pub assume_rbr: bool,
    pub allowed_running_on_master: bool,
    pub concurrent_count_table_rows: bool,
    pub timestamp_all_table: bool,
    pub cut_over_type: CutOverType,
    pub serve_socket_file: PathBuf,
    pub postpone_cut_over_flag_file: PathBuf,
    pub hooks_status_interval_sec: u64,
    pub heartbeat_interval_millis: u64,
    pub nice_ratio: f64,
    pub chunk_size: u64,
    pub dml_batch_size: u64,
    pub max_lag_millis_throttle_threshold: u64,
    pub default_num_retries: u64,
    pub cut_over_lock_timeout_seconds: u64,
    pub exponential_backoff_max_interval: u64,
    pub throttle_http_interval_millis: u64,
    pub throttle_http_timeout_millis: u64,
}

impl GhostMigrationContext {
    /// Build the engine context from a configuration.
    pub fn from_config(config: &GhostConfig) -> GhostResult<Self> {
        let statement = normalize_statement(&config.alter_statement);
        let port = if config.port.is_empty() {
            DEFAULT_PORT
        } else {
            config.port.parse::<u16>().map_err(|e| GhostError::InvalidPort {
                port: config.port.clone(),
                reason: e.to_string(),
            })?
        };
        if statement.is_empty() {
            return Err(GhostError::Configuration(
                "alter statement must be provided and must not be empty".to_string(),
            ));
        }

        let target = AlterTarget::parse(&statement);
        let database_name = if config.database.is_empty() {
            target.schema.clone().ok_or_else(|| {
                GhostError::Configuration(
                    "database must be provided, or the alter statement must name it".to_string(),
                )
            })?
        } else {
            config.database.clone()
        };
        let original_table_name = if config.table.is_empty() {
            target.table.clone().ok_or_else(|| {
                GhostError::Configuration(
                    "table must be provided, or the alter statement must name it".to_string(),
                )
            })?
        } else {
            config.table.clone()
        };

        let context = Self {
            host: config.host.clone(),
            port,
            user: config.user.clone(),
            password: config.password.clone(),
            database_name,
            original_table_name,
            alter_statement: statement,
            alter_statement_options: target.options,
            noop: config.noop,
            replica_server_id: config.server_id,
            assume_rbr: config.is_aws,
            allowed_running_on_master: defaults::ALLOWED_RUNNING_ON_MASTER,
            concurrent_count_table_rows: defaults::CONCURRENT_COUNT_TABLE_ROWS,
            timestamp_all_table: defaults::TIMESTAMP_ALL_TABLE,
            cut_over_type: CutOverType::Atomic,
            serve_socket_file: config.socket_path.clone(),
            postpone_cut_over_flag_file: config.postpone_flag_path.clone(),
            hooks_status_interval_sec: defaults::HOOKS_STATUS_INTERVAL_SEC,
            heartbeat_interval_millis: defaults::HEARTBEAT_INTERVAL_MILLIS,
            nice_ratio: defaults::NICE_RATIO,
            chunk_size: defaults::CHUNK_SIZE,
            dml_batch_size: defaults::DML_BATCH_SIZE,
            max_lag_millis_throttle_threshold: defaults::MAX_LAG_MILLIS_THROTTLE_THRESHOLD,
            default_num_retries: defaults::DEFAULT_NUM_RETRIES,
            cut_over_lock_timeout_seconds: defaults::CUT_OVER_LOCK_TIMEOUT_SECONDS,
            exponential_backoff_max_interval: defaults::EXPONENTIAL_BACKOFF_MAX_INTERVAL,
            throttle_http_interval_millis: defaults::THROTTLE_HTTP_INTERVAL_MILLIS,
            throttle_http_timeout_millis: defaults::THROTTLE_HTTP_TIMEOUT_MILLIS,
        };
        context.validate()?;

        tracing::debug!(
            database = %context.database_name,
            table = %context.original_table_name,
            server_id = context.replica_server_id,
            assume_rbr = context.assume_rbr,
            "built online migration context"
        );
        Ok(context)
    }

    /// Check the bounds the engine enforces on its tunables.
    pub fn validate(&self) -> GhostResult<()> {
        if !(100..=100_000).contains(&self.chunk_size) {
            return Err(GhostError::InvalidOption { name: "chunk_size", value: self.chunk_size });
        }
        if !(1..=100).contains(&self.dml_batch_size) {
            return Err(GhostError::InvalidOption {
                name: "dml_batch_size",
                value: self.dml_batch_size,
            });
        }
        if !(1..=10).contains(&self.cut_over_lock_timeout_seconds) {
            return Err(GhostError::InvalidOption {
                name: "cut_over_lock_timeout_seconds",
                value: self.cut_over_lock_timeout_seconds,
            });
        }
        if self.exponential_backoff_max_interval < 2 {
            return Err(GhostError::InvalidOption {
                name: "exponential_backoff_max_interval",
                value: self.exponential_backoff_max_interval,
            });
        }
        Ok(())
    }
}
