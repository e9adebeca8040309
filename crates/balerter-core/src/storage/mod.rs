//! Core storage layer for Balerter
//!
//! Every storage instance provides a KV sub-store and an alert sub-store.
//! A memory instance named [`MEMORY_STORAGE`] always exists; SQL instances
//! (SQLite, Postgres) are added from configuration.

mod memory;
mod sql;

pub use memory::MemoryStorage;
pub use sql::SqlStorage;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info};

use crate::config::{CoreStorageConfig, StoragesConfig};
use crate::error::{Error, Result};
use crate::models::{Alert, Level};

/// Name of the always-present in-memory storage
pub const MEMORY_STORAGE: &str = "memory";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid"));

/// Whether `s` is safe to interpolate as a SQL table or column name
pub fn is_valid_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

/// String key/value sub-store
#[async_trait]
pub trait KvStorage: Send + Sync {
    /// Insert a new key; fails with [`Error::KeyExists`] if it is already stored
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Read a key; fails with [`Error::NotFound`] if absent
    async fn get(&self, key: &str) -> Result<String>;

    /// Insert or overwrite a key
    async fn upsert(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; fails with [`Error::NotFound`] if absent
    async fn delete(&self, key: &str) -> Result<()>;

    /// Snapshot of every pair
    async fn all(&self) -> Result<BTreeMap<String, String>>;
}

/// Alert sub-store
#[async_trait]
pub trait AlertStorage: Send + Sync {
    /// Create the alert if unseen, otherwise record another observation at `level`.
    ///
    /// Returns the stored alert and whether its level changed. A new alert
    /// counts as changed unless it starts at [`Level::Success`].
    async fn update(&self, name: &str, level: Level) -> Result<(Alert, bool)>;

    /// Read one alert; `Ok(None)` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<Alert>>;

    /// Alerts whose level is in `levels` (all alerts when empty), sorted by name
    async fn index(&self, levels: &[Level]) -> Result<Vec<Alert>>;

    /// Every alert, sorted by name
    async fn all(&self) -> Result<Vec<Alert>> {
        self.index(&[]).await
    }
}

/// A named storage instance
#[async_trait]
pub trait CoreStorage: Send + Sync {
    /// Instance name
    fn name(&self) -> &str;

    /// KV sub-store
    fn kv(&self) -> &dyn KvStorage;

    /// Alert sub-store
    fn alert(&self) -> &dyn AlertStorage;

    /// Release held resources
    async fn stop(&self) -> Result<()>;
}

/// Storage instances selected for the alert and KV roles
#[derive(Clone)]
pub struct CoreStorages {
    /// Backs the alert manager
    pub alert: Arc<dyn CoreStorage>,
    /// Backs the KV API
    pub kv: Arc<dyn CoreStorage>,
}

/// Named storage instances
#[derive(Clone)]
pub struct StorageRegistry {
    storages: HashMap<String, Arc<dyn CoreStorage>>,
}

impl StorageRegistry {
    /// Registry holding only the memory storage
    pub fn new() -> Self {
        let memory: Arc<dyn CoreStorage> = Arc::new(MemoryStorage::new(MEMORY_STORAGE));
        Self {
            storages: HashMap::from([(MEMORY_STORAGE.to_string(), memory)]),
        }
    }

    /// Connect every configured storage instance
    pub async fn from_config(config: &StoragesConfig) -> Result<Self> {
        let mut registry = Self::new();

        for storage in config.sqlite.iter().chain(config.postgres.iter()) {
            let sql = SqlStorage::connect(storage)
                .await
                .map_err(|e| e.context(format!("init storage '{}'", storage.name)))?;
            registry.insert(Arc::new(sql))?;
        }

        info!(storages = ?registry.names(), "Core storages initialized");
        Ok(registry)
    }

    /// Add an instance; names must be unique
    pub fn insert(&mut self, storage: Arc<dyn CoreStorage>) -> Result<()> {
        let name = storage.name().to_string();
        if self.storages.contains_key(&name) {
            return Err(Error::config(format!("duplicate storage name '{name}'")));
        }
        self.storages.insert(name, storage);
        Ok(())
    }

    /// Look up an instance by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn CoreStorage>> {
        self.storages
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("storage", name))
    }

    /// Resolve the instances named in `core_storage`
    pub fn resolve(&self, config: &CoreStorageConfig) -> Result<CoreStorages> {
        Ok(CoreStorages {
            alert: self
                .get(&config.alert)
                .map_err(|e| e.context("core_storage.alert"))?,
            kv: self.get(&config.kv).map_err(|e| e.context("core_storage.kv"))?,
        })
    }

    /// Sorted instance names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.storages.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every instance, logging failures
    pub async fn stop_all(&self) {
        for (name, storage) in &self.storages {
            if let Err(e) = storage.stop().await {
                error!(storage = %name, error = %e, "Error stopping storage");
            }
        }
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
