//! Catalog facts about instances and databases.
//!
//! Catalog rows are owned elsewhere; this crate only reads them.

use crate::engine::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Database identifier.
pub type DatabaseId = i64;

/// Instance identifier.
pub type InstanceId = i64;

/// Synchronization state of a database with its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// The database exists on the instance.
    #[default]
    Ok,
    /// The database was not found during the last sync.
    NotFound,
}

/// A named secret attached to a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub value: String,
}

/// A database known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub id: DatabaseId,
    pub instance_id: InstanceId,
    #[serde(default)]
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub sync_state: SyncState,
    #[serde(default, skip_serializing)]
    pub secrets: Vec<Secret>,
}

impl Database {
    /// Create a database with no labels or secrets.
    pub fn new(id: DatabaseId, instance_id: InstanceId, name: impl Into<String>) -> Self {
        Self {
            id,
            instance_id,
            project_id: 0,
            name: name.into(),
            labels: BTreeMap::new(),
            sync_state: SyncState::Ok,
            secrets: Vec::new(),
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a secret.
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.push(Secret {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Set the sync state.
    pub fn with_sync_state(mut self, state: SyncState) -> Self {
        self.sync_state = state;
        self
    }

    /// Secret name to value map used when rendering statements.
    pub fn secret_map(&self) -> HashMap<String, String> {
        self.secrets
            .iter()
            .map(|secret| (secret.name.clone(), secret.value.clone()))
            .collect()
    }
}

/// Purpose of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceType {
    Admin,
    ReadOnly,
}

/// Connection details for one data source of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(rename = "type")]
    pub kind: DataSourceType,
    pub host: String,
    #[serde(default)]
    pub port: String,
    pub username: String,
}

/// A database server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub engine: Engine,
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
}

impl Instance {
    /// First data source of the given type.
    pub fn data_source(&self, kind: DataSourceType) -> Option<&DataSource> {
        self.data_sources.iter().find(|ds| ds.kind == kind)
    }
}

/// An account on an instance together with its grant text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUser {
    pub name: String,
    pub grant: String,
}

/// Read access to catalog databases.
pub trait DatabaseCatalog: Send + Sync {
    /// Look up a database by id.
    fn get_database(&self, id: DatabaseId) -> Result<Option<Database>, crate::error::Error>;
}

/// Catalog held in memory, loaded from a database list.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    databases: HashMap<DatabaseId, Database>,
}

impl MemoryCatalog {
    pub fn new(databases: impl IntoIterator<Item = Database>) -> Self {
        Self {
            databases: databases.into_iter().map(|db| (db.id, db)).collect(),
        }
    }
}

impl DatabaseCatalog for MemoryCatalog {
    fn get_database(&self, id: DatabaseId) -> Result<Option<Database>, crate::error::Error> {
        Ok(self.databases.get(&id).cloned())
    }
}
