//! Database engine families and the checks each one supports.

use serde::{Deserialize, Serialize};

/// Capability predicates consulted by the task gate.
pub trait EngineCapabilities {
    /// Whether statements can be syntax-checked before execution.
    fn supports_syntax_check(&self) -> bool;

    /// Whether the SQL review (advisor) check runs for this engine.
    fn supports_review(&self) -> bool;

    /// Whether a statement-type check is required before execution.
    fn requires_statement_type_check(&self) -> bool {
        false
    }
}

/// Supported database engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Engine {
    MySql,
    MariaDb,
    TiDb,
    OceanBase,
    Postgres,
    Oracle,
    MsSql,
    Snowflake,
    ClickHouse,
    Sqlite,
    MongoDb,
    Redis,
}

impl Engine {
    /// Parse an engine name case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        let engine = match name.to_ascii_lowercase().as_str() {
            "mysql" => Engine::MySql,
            "mariadb" => Engine::MariaDb,
            "tidb" => Engine::TiDb,
            "oceanbase" => Engine::OceanBase,
            "postgres" | "postgresql" => Engine::Postgres,
            "oracle" => Engine::Oracle,
            "mssql" => Engine::MsSql,
            "snowflake" => Engine::Snowflake,
            "clickhouse" => Engine::ClickHouse,
            "sqlite" => Engine::Sqlite,
            "mongodb" => Engine::MongoDb,
            "redis" => Engine::Redis,
            _ => return None,
        };
        Some(engine)
    }
}

impl EngineCapabilities for Engine {
    fn supports_syntax_check(&self) -> bool {
        matches!(
            self,
            Engine::MySql | Engine::MariaDb | Engine::TiDb | Engine::OceanBase | Engine::Postgres
        )
    }

    fn supports_review(&self) -> bool {
        matches!(
            self,
            Engine::MySql
                | Engine::MariaDb
                | Engine::TiDb
                | Engine::OceanBase
                | Engine::Postgres
                | Engine::Oracle
                | Engine::MsSql
                | Engine::Snowflake
        )
    }

    fn requires_statement_type_check(&self) -> bool {
        *self == Engine::Postgres
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Engine::MySql => "MYSQL",
            Engine::MariaDb => "MARIADB",
            Engine::TiDb => "TIDB",
            Engine::OceanBase => "OCEANBASE",
            Engine::Postgres => "POSTGRES",
            Engine::Oracle => "ORACLE",
            Engine::MsSql => "MSSQL",
            Engine::Snowflake => "SNOWFLAKE",
            Engine::ClickHouse => "CLICKHOUSE",
            Engine::Sqlite => "SQLITE",
            Engine::MongoDb => "MONGODB",
            Engine::Redis => "REDIS",
        };
        write!(f, "{name}")
    }
}
