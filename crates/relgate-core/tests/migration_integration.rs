//! Integration tests for the migration coordinator over a sled history store.

use parking_lot::Mutex;
use relgate_core::catalog::{Database, MemoryCatalog};
use relgate_core::engine::Engine;
use relgate_core::migration::{
    latest_schema_version, CancelToken, CoordinatorConfig, Driver, DriverError, HistoryStore,
    MigrationCoordinator, MigrationError, MigrationInfo, MigrationStatus, MigrationType,
    SledHistoryStore,
};
use std::io::Write;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

struct TestContext {
    coordinator: MigrationCoordinator,
    store: Arc<SledHistoryStore>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = Arc::new(SledHistoryStore::open(&db).unwrap());
        let catalog = Arc::new(MemoryCatalog::new([
            Database::new(2, 1, "app").with_secret("APP_PASSWORD", "s3cr3t"),
            Database::new(3, 1, "billing"),
        ]));
        let coordinator =
            MigrationCoordinator::new(store.clone(), catalog, CoordinatorConfig::default());
        Self {
            coordinator,
            store,
            _dir: dir,
        }
    }
}

/// Driver whose schema is the concatenation of executed statements.
struct RecordingDriver {
    schema: Mutex<String>,
    delay: Duration,
}

impl RecordingDriver {
    fn new() -> Self {
        Self {
            schema: Mutex::new(String::new()),
            delay: Duration::ZERO,
        }
    }
}

impl Driver for RecordingDriver {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    fn dump(
        &self,
        token: &CancelToken,
        out: &mut dyn Write,
        _schema_only: bool,
    ) -> Result<(), DriverError> {
        token.check()?;
        out.write_all(self.schema.lock().as_bytes())?;
        Ok(())
    }

    fn execute(
        &self,
        token: &CancelToken,
        statement: &str,
        _create_database: bool,
    ) -> Result<(), DriverError> {
        // Poll like a driver waiting on the server.
        let until = Instant::now() + self.delay;
        while Instant::now() < until {
            token.check()?;
            thread::sleep(Duration::from_millis(1));
        }
        token.check()?;
        self.schema.lock().push_str(statement);
        Ok(())
    }
}

fn info(database_id: i64, version: &str, issue: &str) -> MigrationInfo {
    MigrationInfo::new(1, database_id, "app", version, issue, MigrationType::Migrate)
}

#[test]
fn test_concurrent_begin_creates_one_record() {
    let ctx = Arc::new(TestContext::new());
    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ctx.coordinator.begin_migration("", &info(2, "0001", "7"), "ALTER TABLE t ADD c INT;")
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(result, Err(MigrationError::MigrationInProgress { .. })));
    }
    assert_eq!(ctx.store.list().unwrap().len(), 1);
}

#[test]
fn test_concurrent_execute_produces_single_done() {
    let ctx = Arc::new(TestContext::new());
    let driver = Arc::new(RecordingDriver {
        schema: Mutex::new(String::new()),
        delay: Duration::from_millis(20),
    });
    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let driver = Arc::clone(&driver);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ctx.coordinator.execute_migration(
                    driver.as_ref(),
                    &CancelToken::new(),
                    &info(2, "0001", "7"),
                    "S1;",
                )
            })
        })
        .collect();

    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => {}
            Err(MigrationError::MigrationInProgress { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let records = ctx.store.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, MigrationStatus::Done);
    assert_eq!(driver.schema.lock().matches("S1;").count(), 1);
}

#[test]
fn test_different_databases_run_independently() {
    let ctx = TestContext::new();
    let driver = RecordingDriver::new();

    let app = ctx
        .coordinator
        .execute_migration(&driver, &CancelToken::new(), &info(2, "0001", "7"), "A;")
        .unwrap();
    let billing = ctx
        .coordinator
        .execute_migration(&driver, &CancelToken::new(), &info(3, "0001", "7"), "B;")
        .unwrap();

    assert_ne!(app.record_id, billing.record_id);
    assert_eq!(ctx.store.list().unwrap().len(), 2);
}

#[test]
fn test_version_history_and_replay() {
    let ctx = TestContext::new();
    let driver = RecordingDriver::new();

    for version in ["0001", "0002", "0003"] {
        ctx.coordinator
            .execute_migration(
                &driver,
                &CancelToken::new(),
                &info(2, version, "7"),
                &format!("V{version};"),
            )
            .unwrap();
    }
    assert_eq!(latest_schema_version(ctx.store.as_ref(), 1, Some(2)).unwrap(), "0003");

    let replay = ctx
        .coordinator
        .execute_migration(&driver, &CancelToken::new(), &info(2, "0002", "7"), "V0002;")
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(driver.schema.lock().as_str(), "V0001;V0002;V0003;");
    assert_eq!(ctx.store.list().unwrap().len(), 3);
}

#[test]
fn test_rendered_secret_never_stored() {
    let ctx = TestContext::new();
    let driver = RecordingDriver::new();
    let statement = "CREATE USER app IDENTIFIED BY '${{ secrets.APP_PASSWORD }}';";

    let out = ctx
        .coordinator
        .execute_migration(&driver, &CancelToken::new(), &info(2, "0001", "7"), statement)
        .unwrap();

    let record = ctx.store.get_record(out.record_id).unwrap().unwrap();
    assert_eq!(record.statement, statement);
    // The driver saw the rendered text.
    assert!(driver.schema.lock().contains("s3cr3t"));
}

#[test]
fn test_missing_database_marks_failed() {
    let ctx = TestContext::new();
    let driver = RecordingDriver::new();

    let err = ctx
        .coordinator
        .execute_migration(&driver, &CancelToken::new(), &info(99, "0001", "7"), "S;")
        .unwrap_err();
    assert!(matches!(err, MigrationError::DatabaseNotFound(99)));

    let records = ctx.store.list().unwrap();
    assert_eq!(records[0].status, MigrationStatus::Failed);
}

#[test]
fn test_cancel_from_another_thread_fails_running_migration() {
    let ctx = TestContext::new();
    let driver = RecordingDriver {
        schema: Mutex::new(String::new()),
        delay: Duration::from_secs(30),
    };
    let token = CancelToken::new();

    let canceler = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        })
    };
    let started = Instant::now();
    let err = ctx
        .coordinator
        .execute_migration(&driver, &token, &info(2, "0001", "7"), "S;")
        .unwrap_err();
    canceler.join().unwrap();

    assert!(matches!(err, MigrationError::Driver(DriverError::Canceled)));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(driver.schema.lock().is_empty());

    let records = ctx.store.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, MigrationStatus::Failed);
}

#[test]
fn test_timeout_bounds_slow_statement() {
    let ctx = TestContext::new();
    let driver = RecordingDriver {
        schema: Mutex::new(String::new()),
        delay: Duration::from_secs(30),
    };

    let err = ctx
        .coordinator
        .execute_migration(
            &driver,
            &CancelToken::with_timeout(Duration::from_millis(200)),
            &info(3, "0001", "7"),
            "S;",
        )
        .unwrap_err();
    assert!(matches!(err, MigrationError::Driver(DriverError::Canceled)));
    assert_eq!(ctx.store.list().unwrap()[0].status, MigrationStatus::Failed);
}
