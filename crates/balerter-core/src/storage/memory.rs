//! In-memory core storage

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use super::{AlertStorage, CoreStorage, KvStorage};
use crate::error::{Error, Result};
use crate::models::{Alert, Level};

/// Storage instance keeping everything in process memory
pub struct MemoryStorage {
    name: String,
    kv: MemoryKv,
    alerts: MemoryAlerts,
}

impl MemoryStorage {
    /// Create an empty storage
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kv: MemoryKv::default(),
            alerts: MemoryAlerts::default(),
        }
    }
}

#[async_trait]
impl CoreStorage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kv(&self) -> &dyn KvStorage {
        &self.kv
    }

    fn alert(&self) -> &dyn AlertStorage {
        &self.alerts
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryKv {
    data: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl KvStorage for MemoryKv {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.write();
        if data.contains_key(key) {
            return Err(Error::KeyExists(key.to_string()));
        }
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("key", key))
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        self.data.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("key", key))
    }

    async fn all(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Alerts keyed by name.
///
/// The whole read-modify-write of an update happens under the write lock
/// and callers only ever receive copies, so concurrent updates of the same
/// name serialize instead of racing on a shared value.
#[derive(Default)]
struct MemoryAlerts {
    alerts: RwLock<HashMap<String, Alert>>,
}

#[async_trait]
impl AlertStorage for MemoryAlerts {
    async fn update(&self, name: &str, level: Level) -> Result<(Alert, bool)> {
        let now = Utc::now();
        let mut alerts = self.alerts.write();

        if let Some(alert) = alerts.get_mut(name) {
            let changed = alert.apply(level, now);
            return Ok((alert.clone(), changed));
        }

        debug!(alert = %name, %level, "Creating alert");
        let alert = Alert::new(name, level, now);
        alerts.insert(name.to_string(), alert.clone());
        Ok((alert, level != Level::Success))
    }

    async fn get(&self, name: &str) -> Result<Option<Alert>> {
        Ok(self.alerts.read().get(name).cloned())
    }

    async fn index(&self, levels: &[Level]) -> Result<Vec<Alert>> {
        let mut result: Vec<Alert> = self
            .alerts
            .read()
            .values()
            .filter(|a| levels.is_empty() || levels.contains(&a.level()))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(result)
    }
}
