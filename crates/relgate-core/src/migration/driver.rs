//! Database driver abstraction used to dump schemas and run statements.

use super::cancel::CancelToken;
use crate::engine::Engine;
use crate::render::redact_secrets;
use std::collections::HashMap;
use std::io::Write;
use thiserror::Error;

/// Errors raised by a driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The database vanished, typically after a DROP DATABASE statement.
    #[error("database {0:?} not found")]
    DatabaseNotFound(String),

    /// Schema dump failed.
    #[error("dump failed: {0}")]
    Dump(String),

    /// Statement execution failed.
    #[error("execution failed: {0}")]
    Execute(String),

    /// The caller canceled the operation.
    #[error("canceled")]
    Canceled,

    /// I/O error writing a dump.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn is_database_not_found(&self) -> bool {
        matches!(self, DriverError::DatabaseNotFound(_))
    }

    /// Replace rendered secret values in the message with their placeholders.
    pub fn redact(self, secrets: &HashMap<String, String>) -> Self {
        if secrets.is_empty() {
            return self;
        }
        match self {
            DriverError::DatabaseNotFound(m) => {
                DriverError::DatabaseNotFound(redact_secrets(&m, secrets))
            }
            DriverError::Dump(m) => DriverError::Dump(redact_secrets(&m, secrets)),
            DriverError::Execute(m) => DriverError::Execute(redact_secrets(&m, secrets)),
            DriverError::Io(e) => {
                DriverError::Io(std::io::Error::new(e.kind(), redact_secrets(&e.to_string(), secrets)))
            }
            other => other,
        }
    }
}

/// A live connection to one database.
///
/// Every call receives the caller's [`CancelToken`]. Implementations should
/// pass its deadline to the server as a statement timeout and return
/// `DriverError::Canceled` once the token fires.
pub trait Driver: Send + Sync {
    /// Engine family of the connected instance.
    fn engine(&self) -> Engine;

    /// Write the schema (or full contents) of the database to `out`.
    fn dump(
        &self,
        ctx: &CancelToken,
        out: &mut dyn Write,
        schema_only: bool,
    ) -> Result<(), DriverError>;

    /// Execute `statement`. `create_database` marks a CREATE DATABASE run
    /// which must not select a database first.
    fn execute(
        &self,
        ctx: &CancelToken,
        statement: &str,
        create_database: bool,
    ) -> Result<(), DriverError>;
}

/// Dump the schema into a string.
pub fn dump_schema(driver: &dyn Driver, ctx: &CancelToken) -> Result<String, DriverError> {
    ctx.check()?;
    let mut buf = Vec::new();
    driver.dump(ctx, &mut buf, true)?;
    String::from_utf8(buf).map_err(|e| DriverError::Dump(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_driver_error() {
        let secrets: HashMap<String, String> =
            [("PW".to_string(), "hunter2".to_string())].into_iter().collect();
        let err = DriverError::Execute("syntax error near 'hunter2'".into()).redact(&secrets);
        assert_eq!(err.to_string(), "execution failed: syntax error near '${{ secrets.PW }}'");
        assert!(!DriverError::Canceled.redact(&secrets).is_database_not_found());
    }
}
