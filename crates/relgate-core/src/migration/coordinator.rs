//! Migration coordinator - owns the begin/execute/end lifecycle.
//!
//! A migration attempt dumps the pre-image, claims a history record, runs the
//! statement, dumps the post-image and finalizes the record. The finalizer is
//! a scope guard, so every exit path observed by the coordinator (error
//! returns and panics included) leaves the record Done or Failed.
//!
//! The caller's [`CancelToken`] is checked before the record is claimed and
//! again before the statement runs. Cancellation after the claim fails the
//! record.

use super::cancel::CancelToken;
use super::driver::{dump_schema, Driver, DriverError};
use super::error::{MigrationError, MigrationResult};
use super::lock::KeyedLocks;
use super::record::{
    truncate_statement, MigrationInfo, MigrationRecord, MigrationStatus, MigrationType, RecordId,
    RecordUpdate,
};
use super::store::HistoryStore;
use crate::catalog::{DatabaseCatalog, DatabaseId, InstanceId};
use crate::render::render_statement;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default cap on the statement text kept in a history record.
pub const DEFAULT_MAX_STATEMENT_SIZE: usize = 2 * 1024 * 1024;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Statements longer than this are truncated before being recorded.
    pub max_statement_size: usize,
    /// Whether `${{ secrets.NAME }}` placeholders are rendered before execution.
    pub render_secrets: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_statement_size: DEFAULT_MAX_STATEMENT_SIZE,
            render_secrets: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_statement_size(mut self, size: usize) -> Self {
        self.max_statement_size = size;
        self
    }

    pub fn with_render_secrets(mut self, render: bool) -> Self {
        self.render_secrets = render;
        self
    }
}

/// Outcome of a migration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutput {
    /// History record of the attempt.
    pub record_id: RecordId,
    /// Schema after the migration.
    pub schema: String,
    /// The version was already applied by the same issue; nothing ran.
    pub replayed: bool,
}

/// Coordinates migration attempts against the history store.
pub struct MigrationCoordinator {
    store: Arc<dyn HistoryStore>,
    catalog: Arc<dyn DatabaseCatalog>,
    locks: KeyedLocks<(InstanceId, Option<DatabaseId>)>,
    config: CoordinatorConfig,
}

impl MigrationCoordinator {
    /// Create a new coordinator.
    pub fn new(
        store: Arc<dyn HistoryStore>,
        catalog: Arc<dyn DatabaseCatalog>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Claim a history record for `info`.
    ///
    /// Returns the id of a new pending record, or of an existing one when
    /// `force` allows reusing it. A version already applied by the same issue
    /// yields `DuplicateVersionApplied`, which callers treat as success.
    pub fn begin_migration(
        &self,
        prev_schema: &str,
        info: &MigrationInfo,
        statement: &str,
    ) -> MigrationResult<RecordId> {
        let lock = self.locks.handle(&(info.instance_id, info.database_id));
        let result = {
            let _guard = lock.lock();
            self.begin_locked(prev_schema, info, statement)
        };
        drop(lock);
        self.locks.prune();
        result
    }

    fn begin_locked(
        &self,
        prev_schema: &str,
        info: &MigrationInfo,
        statement: &str,
    ) -> MigrationResult<RecordId> {
        let statement = truncate_statement(statement, self.config.max_statement_size);

        if let Some(existing) = self.store.find_history(&info.history_key())?.into_iter().next() {
            return self.resolve_existing(existing, info, prev_schema, statement);
        }

        match self.store.create_pending(info, prev_schema, statement) {
            Ok(record_id) => {
                info!(
                    instance = info.instance_id,
                    database = %info.database_name,
                    version = %info.version,
                    record_id,
                    "migration started"
                );
                Ok(record_id)
            }
            // Another process claimed the slot between our lookup and insert.
            Err(MigrationError::VersionSlotTaken { record_id, .. }) => {
                let existing = self
                    .store
                    .get_record(record_id)?
                    .ok_or(MigrationError::RecordNotFound(record_id))?;
                self.resolve_existing(existing, info, prev_schema, statement)
            }
            Err(e) => Err(e),
        }
    }

    fn resolve_existing(
        &self,
        existing: MigrationRecord,
        info: &MigrationInfo,
        prev_schema: &str,
        statement: &str,
    ) -> MigrationResult<RecordId> {
        debug!(
            instance = info.instance_id,
            database = %info.database_name,
            version = %info.version,
            record_id = existing.id,
            status = %existing.status,
            "found existing migration record"
        );

        match existing.status {
            MigrationStatus::Done if existing.issue_id != info.issue_id => {
                Err(MigrationError::ConflictingVersionApplied {
                    record_id: existing.id,
                    database: info.database_name.clone(),
                    version: info.version.clone(),
                    issue_id: existing.issue_id,
                })
            }
            MigrationStatus::Done => Err(MigrationError::DuplicateVersionApplied {
                record_id: existing.id,
                database: info.database_name.clone(),
                version: info.version.clone(),
            }),
            MigrationStatus::Pending if info.force => Ok(existing.id),
            MigrationStatus::Pending => Err(MigrationError::MigrationInProgress {
                record_id: existing.id,
                database: info.database_name.clone(),
                version: info.version.clone(),
            }),
            MigrationStatus::Failed if info.force => {
                self.store.reopen(existing.id, prev_schema, statement)?;
                info!(record_id = existing.id, version = %info.version, "retrying failed migration");
                Ok(existing.id)
            }
            MigrationStatus::Failed => Err(MigrationError::MigrationPreviouslyFailed {
                record_id: existing.id,
                database: info.database_name.clone(),
                version: info.version.clone(),
            }),
        }
    }

    /// Finalize a record: Done with `schema`, or Failed when `schema` is `None`.
    pub fn end_migration(
        &self,
        record_id: RecordId,
        duration: Duration,
        schema: Option<&str>,
    ) -> MigrationResult<()> {
        let duration_ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let update = match schema {
            Some(schema) => RecordUpdate::Done {
                schema: schema.to_string(),
                duration_ns,
            },
            None => RecordUpdate::Failed { duration_ns },
        };
        let done = matches!(update, RecordUpdate::Done { .. });
        self.store.update_record(record_id, update)?;

        info!(
            record_id,
            status = if done { "DONE" } else { "FAILED" },
            duration_ms = duration.as_millis() as u64,
            "migration finished"
        );
        Ok(())
    }

    /// Run one migration attempt, executing the statement through `exec`.
    ///
    /// Baseline migrations and empty statements skip `exec` and only record
    /// the current schema. `exec` is expected to honor `ctx` itself.
    pub fn execute_migration_with<F>(
        &self,
        driver: &dyn Driver,
        ctx: &CancelToken,
        info: &MigrationInfo,
        statement: &str,
        exec: F,
    ) -> MigrationResult<MigrationOutput>
    where
        F: FnOnce(&str) -> Result<(), DriverError>,
    {
        let prev_schema = dump_schema(driver, ctx)?;
        ctx.check()?;

        let record_id = match self.begin_migration(&prev_schema, info, statement) {
            Ok(record_id) => record_id,
            Err(MigrationError::DuplicateVersionApplied { record_id, .. }) => {
                info!(
                    record_id,
                    database = %info.database_name,
                    version = %info.version,
                    "migration already applied"
                );
                return Ok(MigrationOutput {
                    record_id,
                    schema: prev_schema,
                    replayed: true,
                });
            }
            Err(e) => return Err(e),
        };

        let finalizer = Finalizer::new(self, record_id);

        if !statement.is_empty() && info.migration_type != MigrationType::Baseline {
            let secrets = self.secrets_for(info)?;
            let rendered = render_statement(statement, &secrets);
            ctx.check()?;
            exec(rendered.as_str()).map_err(|e| e.redact(&secrets))?;
        }

        let schema = match dump_schema(driver, ctx) {
            Ok(schema) => schema,
            // The statement may have dropped the database.
            Err(e) if e.is_database_not_found() => {
                warn!(record_id, database = %info.database_name, "database gone after migration");
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        finalizer.succeed(&schema)?;
        Ok(MigrationOutput {
            record_id,
            schema,
            replayed: false,
        })
    }

    /// Run one migration attempt through `driver.execute`.
    pub fn execute_migration(
        &self,
        driver: &dyn Driver,
        ctx: &CancelToken,
        info: &MigrationInfo,
        statement: &str,
    ) -> MigrationResult<MigrationOutput> {
        self.execute_migration_with(driver, ctx, info, statement, |stmt| {
            driver.execute(ctx, stmt, info.create_database)
        })
    }

    fn secrets_for(&self, info: &MigrationInfo) -> MigrationResult<HashMap<String, String>> {
        if !self.config.render_secrets {
            return Ok(HashMap::new());
        }
        let Some(database_id) = info.database_id else {
            return Ok(HashMap::new());
        };
        let database = self
            .catalog
            .get_database(database_id)?
            .ok_or(MigrationError::DatabaseNotFound(database_id))?;
        Ok(database.secret_map())
    }
}

/// Marks the record Failed on drop unless `succeed` was called.
struct Finalizer<'a> {
    coordinator: &'a MigrationCoordinator,
    record_id: RecordId,
    started: Instant,
    armed: bool,
}

impl<'a> Finalizer<'a> {
    fn new(coordinator: &'a MigrationCoordinator, record_id: RecordId) -> Self {
        Self {
            coordinator,
            record_id,
            started: Instant::now(),
            armed: true,
        }
    }

    fn succeed(mut self, schema: &str) -> MigrationResult<()> {
        self.armed = false;
        self.coordinator
            .end_migration(self.record_id, self.started.elapsed(), Some(schema))
    }
}

impl Drop for Finalizer<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self
            .coordinator
            .end_migration(self.record_id, self.started.elapsed(), None)
        {
            warn!(record_id = self.record_id, error = %e, "failed to mark migration failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Database, MemoryCatalog};
    use crate::engine::Engine;
    use crate::migration::store::SledHistoryStore;
    use parking_lot::Mutex;
    use std::io::Write;

    struct FakeDriver {
        schema: Mutex<String>,
        executed: Mutex<Vec<String>>,
        fail_with: Option<String>,
        echo_width: Option<usize>,
        drops_database: bool,
        dropped: Mutex<bool>,
        dump_fails_after_execute: bool,
        ran: Mutex<bool>,
    }

    impl FakeDriver {
        fn new(schema: &str) -> Self {
            Self {
                schema: Mutex::new(schema.to_string()),
                executed: Mutex::new(Vec::new()),
                fail_with: None,
                echo_width: None,
                drops_database: false,
                dropped: Mutex::new(false),
                dump_fails_after_execute: false,
                ran: Mutex::new(false),
            }
        }
    }

    impl Driver for FakeDriver {
        fn engine(&self) -> Engine {
            Engine::MySql
        }

        fn dump(
            &self,
            ctx: &CancelToken,
            out: &mut dyn Write,
            _schema_only: bool,
        ) -> Result<(), DriverError> {
            ctx.check()?;
            if *self.dropped.lock() {
                return Err(DriverError::DatabaseNotFound("app".into()));
            }
            if self.dump_fails_after_execute && *self.ran.lock() {
                return Err(DriverError::Dump("lost connection during dump".into()));
            }
            out.write_all(self.schema.lock().as_bytes())?;
            Ok(())
        }

        fn execute(
            &self,
            ctx: &CancelToken,
            statement: &str,
            _create_database: bool,
        ) -> Result<(), DriverError> {
            ctx.check()?;
            self.executed.lock().push(statement.to_string());
            if let Some(width) = self.echo_width {
                let near: String = statement.chars().take(width).collect();
                return Err(DriverError::Execute(format!("syntax error near '{near}'")));
            }
            if let Some(message) = &self.fail_with {
                return Err(DriverError::Execute(format!("{message}: {statement}")));
            }
            std::thread::sleep(Duration::from_millis(1));
            *self.ran.lock() = true;
            if self.drops_database {
                *self.dropped.lock() = true;
            }
            self.schema.lock().push_str(statement);
            Ok(())
        }
    }

    fn coordinator() -> MigrationCoordinator {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = Arc::new(SledHistoryStore::open(&db).unwrap());
        let catalog = Arc::new(MemoryCatalog::new([
            Database::new(2, 1, "app")
                .with_secret("PW", "hunter2")
                .with_secret("TOKEN", "tok_live_ABCDEFGHIJKLMNOP")
        ]));
        MigrationCoordinator::new(store, catalog, CoordinatorConfig::default())
    }

    fn info(version: &str, issue: &str) -> MigrationInfo {
        MigrationInfo::new(1, 2, "app", version, issue, MigrationType::Migrate)
    }

    fn ctx() -> CancelToken {
        CancelToken::new()
    }

    fn status(c: &MigrationCoordinator, id: RecordId) -> MigrationStatus {
        c.store().get_record(id).unwrap().unwrap().status
    }

    #[test]
    fn test_execute_records_done() {
        let c = coordinator();
        let driver = FakeDriver::new("CREATE TABLE t (id INT);");
        let out = c
            .execute_migration(&driver, &ctx(), &info("v1", "10"), "ALTER TABLE t ADD c INT;")
            .unwrap();

        assert!(!out.replayed);
        assert_eq!(out.schema, "CREATE TABLE t (id INT);ALTER TABLE t ADD c INT;");
        let record = c.store().get_record(out.record_id).unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Done);
        assert_eq!(record.prev_schema, "CREATE TABLE t (id INT);");
        assert_eq!(record.schema, out.schema);
    }

    #[test]
    fn test_replay_same_issue_is_success() {
        let c = coordinator();
        let driver = FakeDriver::new("");
        let first = c.execute_migration(&driver, &ctx(), &info("v1", "10"), "S1;").unwrap();
        let second = c.execute_migration(&driver, &ctx(), &info("v1", "10"), "S1;").unwrap();

        assert!(second.replayed);
        assert_eq!(second.record_id, first.record_id);
        assert_eq!(driver.executed.lock().len(), 1);
    }

    #[test]
    fn test_conflicting_issue_is_fatal() {
        let c = coordinator();
        let driver = FakeDriver::new("");
        c.execute_migration(&driver, &ctx(), &info("v1", "10"), "S1;").unwrap();
        let err = c.execute_migration(&driver, &ctx(), &info("v1", "11"), "S1;").unwrap_err();
        assert!(matches!(
            err,
            MigrationError::ConflictingVersionApplied { ref issue_id, .. } if issue_id == "10"
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_pending_requires_force() {
        let c = coordinator();
        let id = c.begin_migration("", &info("v1", "10"), "S1;").unwrap();
        let err = c.begin_migration("", &info("v1", "10"), "S1;").unwrap_err();
        assert!(matches!(err, MigrationError::MigrationInProgress { record_id, .. } if record_id == id));

        let forced = c
            .begin_migration("", &info("v1", "10").with_force(true), "S1;")
            .unwrap();
        assert_eq!(forced, id);
    }

    #[test]
    fn test_failed_execution_marks_failed_and_redacts() {
        let c = coordinator();
        let mut driver = FakeDriver::new("");
        driver.fail_with = Some("syntax error".into());

        let err = c
            .execute_migration(
                &driver,
                &ctx(),
                &info("v1", "10"),
                "SET PASSWORD = '${{ secrets.PW }}';",
            )
            .unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("hunter2"));
        assert!(message.contains("${{ secrets.PW }}"));
        assert_eq!(driver.executed.lock()[0], "SET PASSWORD = 'hunter2';");

        let record = c.store().find_history(&info("v1", "10").history_key()).unwrap();
        assert_eq!(record[0].status, MigrationStatus::Failed);
        assert_eq!(record[0].statement, "SET PASSWORD = '${{ secrets.PW }}';");

        let err = c.begin_migration("", &info("v1", "10"), "S;").unwrap_err();
        assert!(matches!(err, MigrationError::MigrationPreviouslyFailed { .. }));
    }

    #[test]
    fn test_force_retries_failed_record() {
        let c = coordinator();
        let mut failing = FakeDriver::new("");
        failing.fail_with = Some("boom".into());
        assert!(c.execute_migration(&failing, &ctx(), &info("v1", "10"), "S1;").is_err());

        let driver = FakeDriver::new("");
        let out = c
            .execute_migration(&driver, &ctx(), &info("v1", "10").with_force(true), "S1;")
            .unwrap();
        assert_eq!(status(&c, out.record_id), MigrationStatus::Done);
        assert_eq!(c.store().find_history(&info("v1", "10").history_key()).unwrap().len(), 1);
    }

    #[test]
    fn test_baseline_skips_execution() {
        let c = coordinator();
        let driver = FakeDriver::new("CREATE TABLE t (id INT);");
        let mut baseline = info("v0", "10");
        baseline.migration_type = MigrationType::Baseline;

        let out = c
            .execute_migration(&driver, &ctx(), &baseline, "ALTER TABLE t ADD c INT;")
            .unwrap();
        assert!(driver.executed.lock().is_empty());
        assert_eq!(out.schema, "CREATE TABLE t (id INT);");
        assert_eq!(status(&c, out.record_id), MigrationStatus::Done);
    }

    #[test]
    fn test_dropped_database_is_success_with_empty_schema() {
        let c = coordinator();
        let mut driver = FakeDriver::new("CREATE TABLE t (id INT);");
        driver.drops_database = true;

        let out = c
            .execute_migration(&driver, &ctx(), &info("v1", "10"), "DROP DATABASE app;")
            .unwrap();
        assert_eq!(out.schema, "");
        assert_eq!(status(&c, out.record_id), MigrationStatus::Done);
    }

    #[test]
    fn test_secrets_not_rendered_for_instance_level() {
        let c = coordinator();
        let driver = FakeDriver::new("");
        let mut instance_level = info("v1", "10");
        instance_level.database_id = None;

        c.execute_migration(&driver, &ctx(), &instance_level, "SELECT '${{ secrets.PW }}';")
            .unwrap();
        assert_eq!(driver.executed.lock()[0], "SELECT '${{ secrets.PW }}';");
    }

    #[test]
    fn test_statement_truncated_in_record() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = Arc::new(SledHistoryStore::open(&db).unwrap());
        let c = MigrationCoordinator::new(
            store,
            Arc::new(MemoryCatalog::default()),
            CoordinatorConfig::default().with_max_statement_size(4),
        );
        let id = c.begin_migration("", &info("v1", "10"), "ALTER TABLE t;").unwrap();
        assert_eq!(c.store().get_record(id).unwrap().unwrap().statement, "ALTE");
    }

    #[test]
    fn test_panic_in_exec_marks_failed() {
        let c = coordinator();
        let driver = FakeDriver::new("");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = c.execute_migration_with(&driver, &ctx(), &info("v1", "10"), "S1;", |_| {
                panic!("worker crashed")
            });
        }));
        assert!(result.is_err());

        let records = c.store().find_history(&info("v1", "10").history_key()).unwrap();
        assert_eq!(records[0].status, MigrationStatus::Failed);
    }

    #[test]
    fn test_end_migration_is_write_once() {
        let c = coordinator();
        let id = c.begin_migration("", &info("v1", "10"), "S1;").unwrap();
        c.end_migration(id, Duration::from_millis(5), Some("schema")).unwrap();
        let err = c.end_migration(id, Duration::from_millis(6), None).unwrap_err();
        assert!(matches!(err, MigrationError::RecordAlreadyFinalized { .. }));
        let record = c.store().get_record(id).unwrap().unwrap();
        assert_eq!(record.execution_duration_ns, 5_000_000);
    }

    #[test]
    fn test_truncated_echo_of_secret_is_redacted() {
        let c = coordinator();
        let mut driver = FakeDriver::new("");
        driver.echo_width = Some(24);

        let err = c
            .execute_migration(
                &driver,
                &ctx(),
                &info("v1", "10"),
                "SET @t = '${{ secrets.TOKEN }}' garbage",
            )
            .unwrap_err();
        assert!(driver.executed.lock()[0].contains("tok_live_ABCDEFGHIJKLMNOP"));

        let message = err.to_string();
        assert!(!message.contains("tok_live"), "{message}");
        assert!(message.contains("${{ secrets.TOKEN }}"), "{message}");
    }

    #[test]
    fn test_post_image_dump_failure_marks_failed() {
        let c = coordinator();
        let mut driver = FakeDriver::new("CREATE TABLE t (id INT);");
        driver.dump_fails_after_execute = true;

        let err = c
            .execute_migration(&driver, &ctx(), &info("v1", "10"), "ALTER TABLE t ADD c INT;")
            .unwrap_err();
        assert!(matches!(err, MigrationError::Driver(DriverError::Dump(_))));
        assert!(!err.is_fatal());
        assert_eq!(driver.executed.lock().len(), 1);

        let records = c.store().find_history(&info("v1", "10").history_key()).unwrap();
        assert_eq!(records[0].status, MigrationStatus::Failed);
        assert!(records[0].execution_duration_ns > 0);
        assert_eq!(records[0].prev_schema, "CREATE TABLE t (id INT);");
    }

    #[test]
    fn test_canceled_before_begin_leaves_no_record() {
        let c = coordinator();
        let driver = FakeDriver::new("");
        let token = ctx();
        token.cancel();

        let err = c
            .execute_migration(&driver, &token, &info("v1", "10"), "S1;")
            .unwrap_err();
        assert!(matches!(err, MigrationError::Driver(DriverError::Canceled)));
        assert!(c.store().find_history(&info("v1", "10").history_key()).unwrap().is_empty());
        assert!(driver.executed.lock().is_empty());
    }

    #[test]
    fn test_cancel_after_claim_marks_failed() {
        let c = coordinator();
        let driver = FakeDriver::new("");
        let token = ctx();

        let err = c
            .execute_migration_with(&driver, &token, &info("v1", "10"), "S1;", |stmt| {
                token.cancel();
                driver.execute(&token, stmt, false)
            })
            .unwrap_err();
        assert!(matches!(err, MigrationError::Driver(DriverError::Canceled)));
        assert!(driver.executed.lock().is_empty());

        let records = c.store().find_history(&info("v1", "10").history_key()).unwrap();
        assert_eq!(records[0].status, MigrationStatus::Failed);
    }

    #[test]
    fn test_expired_deadline_is_canceled() {
        let c = coordinator();
        let driver = FakeDriver::new("");
        let token = CancelToken::new().with_deadline(Instant::now() - Duration::from_millis(1));

        let err = c
            .execute_migration(&driver, &token, &info("v1", "10"), "S1;")
            .unwrap_err();
        assert!(matches!(err, MigrationError::Driver(DriverError::Canceled)));
        assert!(driver.executed.lock().is_empty());
    }

    #[test]
    fn test_locks_released_after_begin() {
        let c = coordinator();
        c.begin_migration("", &info("v1", "10"), "S1;").unwrap();
        let mut other = info("v1", "10");
        other.database_id = None;
        c.begin_migration("", &other, "S1;").unwrap();
        assert!(c.locks.is_empty());

        let driver = FakeDriver::new("");
        c.execute_migration(&driver, &ctx(), &info("v2", "10"), "S2;").unwrap();
        assert!(c.locks.is_empty());
    }
}
