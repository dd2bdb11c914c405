//! Migration history persistence.
//!
//! Every `(instance, database, version)` triple maps to at most one record.
//! The sled store enforces that with a version index updated in the same
//! transaction as the record insert, so concurrent workers racing on a triple
//! cannot both create a pending record.

use super::error::{MigrationError, MigrationResult};
use super::record::{HistoryKey, MigrationInfo, MigrationRecord, RecordId, RecordUpdate};
use crate::catalog::{DatabaseId, InstanceId};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

/// Durable migration history.
pub trait HistoryStore: Send + Sync {
    /// Records for a triple; at most one.
    fn find_history(&self, key: &HistoryKey) -> MigrationResult<Vec<MigrationRecord>>;

    /// Load a record by id.
    fn get_record(&self, id: RecordId) -> MigrationResult<Option<MigrationRecord>>;

    /// Insert a pending record. Fails with `VersionSlotTaken` if the triple
    /// already has one.
    fn create_pending(
        &self,
        info: &MigrationInfo,
        prev_schema: &str,
        statement: &str,
    ) -> MigrationResult<RecordId>;

    /// Return a failed record to pending for a forced retry.
    fn reopen(&self, id: RecordId, prev_schema: &str, statement: &str) -> MigrationResult<()>;

    /// Apply a terminal update to a pending record.
    fn update_record(&self, id: RecordId, update: RecordUpdate) -> MigrationResult<()>;

    /// The most recently created record for an instance or database.
    fn latest(
        &self,
        instance_id: InstanceId,
        database_id: Option<DatabaseId>,
    ) -> MigrationResult<Option<MigrationRecord>>;
}

/// Version of the latest migration applied to a database, or empty.
pub fn latest_schema_version(
    store: &dyn HistoryStore,
    instance_id: InstanceId,
    database_id: Option<DatabaseId>,
) -> MigrationResult<String> {
    Ok(store
        .latest(instance_id, database_id)?
        .map(|record| record.version)
        .unwrap_or_default())
}

/// Sled-backed history store.
pub struct SledHistoryStore {
    db: sled::Db,
    records: sled::Tree,
    versions: sled::Tree,
}

impl SledHistoryStore {
    /// Tree holding records by id.
    pub const RECORDS_TREE: &'static str = "migration:history";
    /// Tree mapping triples to record ids.
    pub const VERSIONS_TREE: &'static str = "migration:version";

    /// Open or create the history store.
    pub fn open(db: &sled::Db) -> MigrationResult<Self> {
        Ok(Self {
            db: db.clone(),
            records: db.open_tree(Self::RECORDS_TREE)?,
            versions: db.open_tree(Self::VERSIONS_TREE)?,
        })
    }

    /// All records in id order.
    pub fn list(&self) -> MigrationResult<Vec<MigrationRecord>> {
        let mut records = Vec::new();
        for result in self.records.iter() {
            let (_, value) = result?;
            records.push(MigrationRecord::from_bytes(&value)?);
        }
        Ok(records)
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> MigrationResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn scope_prefix(instance_id: InstanceId, database_id: Option<DatabaseId>) -> Vec<u8> {
        let mut key = Vec::with_capacity(17);
        key.extend_from_slice(&instance_id.to_be_bytes());
        match database_id {
            Some(id) => {
                key.push(1);
                key.extend_from_slice(&id.to_be_bytes());
            }
            None => {
                key.push(0);
                key.extend_from_slice(&[0u8; 8]);
            }
        }
        key
    }

    fn version_key(key: &HistoryKey) -> Vec<u8> {
        let mut bytes = Self::scope_prefix(key.instance_id, key.database_id);
        bytes.extend_from_slice(key.version.as_bytes());
        bytes
    }

    fn decode_id(bytes: &[u8]) -> MigrationResult<RecordId> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| MigrationError::Deserialization("malformed record id".to_string()))?;
        Ok(RecordId::from_be_bytes(raw))
    }

    /// Load, modify and store a record atomically.
    fn modify<F>(&self, id: RecordId, apply: F) -> MigrationResult<()>
    where
        F: Fn(&mut MigrationRecord) -> MigrationResult<()>,
    {
        let key = id.to_be_bytes();
        let result = self.records.transaction(|tx| {
            let Some(bytes) = tx.get(key)? else {
                return Err(ConflictableTransactionError::Abort(MigrationError::RecordNotFound(id)));
            };
            let mut record =
                MigrationRecord::from_bytes(&bytes).map_err(ConflictableTransactionError::Abort)?;
            apply(&mut record).map_err(ConflictableTransactionError::Abort)?;
            let value = record.to_bytes().map_err(ConflictableTransactionError::Abort)?;
            tx.insert(&key[..], value)?;
            Ok(())
        });
        flatten(result)
    }
}

fn flatten<T>(result: Result<T, TransactionError<MigrationError>>) -> MigrationResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

impl HistoryStore for SledHistoryStore {
    fn find_history(&self, key: &HistoryKey) -> MigrationResult<Vec<MigrationRecord>> {
        let Some(id) = self.versions.get(Self::version_key(key))? else {
            return Ok(Vec::new());
        };
        let id = Self::decode_id(&id)?;
        Ok(self.get_record(id)?.into_iter().collect())
    }

    fn get_record(&self, id: RecordId) -> MigrationResult<Option<MigrationRecord>> {
        match self.records.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(MigrationRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn create_pending(
        &self,
        info: &MigrationInfo,
        prev_schema: &str,
        statement: &str,
    ) -> MigrationResult<RecordId> {
        let id = self.db.generate_id()? + 1;
        let value = MigrationRecord::pending(id, info, prev_schema, statement).to_bytes()?;
        let record_key = id.to_be_bytes();
        let version_key = Self::version_key(&info.history_key());

        let result = (&self.records, &self.versions).transaction(|(records, versions)| {
            if let Some(existing) = versions.get(version_key.as_slice())? {
                let record_id =
                    Self::decode_id(&existing).map_err(ConflictableTransactionError::Abort)?;
                return Err(ConflictableTransactionError::Abort(MigrationError::VersionSlotTaken {
                    record_id,
                    version: info.version.clone(),
                }));
            }
            records.insert(&record_key[..], value.as_slice())?;
            versions.insert(version_key.as_slice(), &record_key[..])?;
            Ok(())
        });
        flatten(result)?;
        Ok(id)
    }

    fn reopen(&self, id: RecordId, prev_schema: &str, statement: &str) -> MigrationResult<()> {
        self.modify(id, |record| record.reopen(prev_schema, statement))
    }

    fn update_record(&self, id: RecordId, update: RecordUpdate) -> MigrationResult<()> {
        self.modify(id, |record| record.finish(&update))
    }

    fn latest(
        &self,
        instance_id: InstanceId,
        database_id: Option<DatabaseId>,
    ) -> MigrationResult<Option<MigrationRecord>> {
        let mut latest: Option<RecordId> = None;
        for result in self.versions.scan_prefix(Self::scope_prefix(instance_id, database_id)) {
            let (_, value) = result?;
            let id = Self::decode_id(&value)?;
            latest = latest.max(Some(id));
        }
        match latest {
            Some(id) => self.get_record(id),
            None => Ok(None),
        }
    }
}
