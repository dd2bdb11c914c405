//! Migration history and execution.
//!
//! Every migration attempt is tracked by a history record keyed by
//! `(instance, database, version)`:
//! - `begin_migration` claims the record (Pending), refusing conflicting,
//!   in-progress or failed versions unless forced
//! - `end_migration` moves it to Done or Failed exactly once
//! - `execute_migration_with` wraps both around schema dumps and the
//!   statement run, finalizing the record on every exit path
//!
//! # Example
//!
//! ```ignore
//! use relgate_core::migration::{
//!     CancelToken, CoordinatorConfig, MigrationCoordinator, SledHistoryStore,
//! };
//!
//! let store = Arc::new(SledHistoryStore::open(&db)?);
//! let coordinator = MigrationCoordinator::new(store, catalog, CoordinatorConfig::default());
//! let ctx = CancelToken::with_timeout(Duration::from_secs(600));
//! let output = coordinator.execute_migration(&driver, &ctx, &info, statement)?;
//! ```

pub mod cancel;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod lock;
pub mod record;
pub mod store;

pub use cancel::CancelToken;
pub use coordinator::{
    CoordinatorConfig, MigrationCoordinator, MigrationOutput, DEFAULT_MAX_STATEMENT_SIZE,
};
pub use driver::{dump_schema, Driver, DriverError};
pub use error::{MigrationError, MigrationResult};
pub use lock::KeyedLocks;
pub use record::{
    truncate_statement, HistoryKey, MigrationInfo, MigrationRecord, MigrationStatus,
    MigrationType, RecordId, RecordUpdate,
};
pub use store::{latest_schema_version, HistoryStore, SledHistoryStore};
