//! Configuration management for Balerter

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{is_valid_identifier, MEMORY_STORAGE};

/// Environment variable prefix, e.g. `BALERTER__SERVER__PORT`
pub const ENV_PREFIX: &str = "BALERTER";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP API configuration
    pub server: ServerConfig,

    /// Core storage instances
    pub storages: StoragesConfig,

    /// Which storage instances back the alert manager and the KV store
    pub core_storage: CoreStorageConfig,

    /// Notification channels
    pub channels: ChannelsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file layered with environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(::config::Config::try_deserialize)
            .map_err(|e| Error::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::from([MEMORY_STORAGE.to_string()]);

        for (kind, storages) in [
            ("sqlite", &self.storages.sqlite),
            ("postgres", &self.storages.postgres),
        ] {
            for storage in storages {
                storage.validate(kind)?;
                if !names.insert(storage.name.clone()) {
                    return Err(Error::config(format!(
                        "duplicate storage name '{}'",
                        storage.name
                    )));
                }
            }
        }

        for (role, name) in [
            ("alert", &self.core_storage.alert),
            ("kv", &self.core_storage.kv),
        ] {
            if !names.contains(name) {
                return Err(Error::config(format!(
                    "core_storage.{role} refers to unknown storage '{name}'"
                )));
            }
        }

        let mut channel_names = HashSet::new();
        let channels = self
            .channels
            .log
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.channels.webhook.iter().map(|c| c.name.as_str()));
        for name in channels {
            if name.trim().is_empty() {
                return Err(Error::config("channel name must not be empty"));
            }
            if !channel_names.insert(name) {
                return Err(Error::config(format!("duplicate channel name '{name}'")));
            }
        }

        for webhook in &self.channels.webhook {
            if webhook.url.is_empty() {
                return Err(Error::config(format!(
                    "webhook channel '{}' has no url",
                    webhook.name
                )));
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(Error::config(format!("unknown logging format '{other}'"))),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// HTTP API port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2000,
        }
    }
}

/// Configured storage instances, grouped by backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragesConfig {
    /// SQLite instances
    pub sqlite: Vec<SqlStorageConfig>,
    /// Postgres instances
    pub postgres: Vec<SqlStorageConfig>,
}

/// Storage selection for the core subsystems
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreStorageConfig {
    /// Storage holding alerts
    pub alert: String,
    /// Storage holding KV pairs
    pub kv: String,
}

impl Default for CoreStorageConfig {
    fn default() -> Self {
        Self {
            alert: MEMORY_STORAGE.to_string(),
            kv: MEMORY_STORAGE.to_string(),
        }
    }
}

/// SQL storage instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlStorageConfig {
    /// Instance name
    pub name: String,
    /// Connection URL (`sqlite://...` or `postgres://...`)
    pub url: String,
    /// Deadline applied to every storage call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum pool connections
    pub max_connections: u32,
    /// Alerts table layout
    pub table_alerts: AlertTableConfig,
    /// KV table layout
    pub table_kv: KvTableConfig,
}

impl Default for SqlStorageConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            timeout: Duration::from_secs(5),
            max_connections: 5,
            table_alerts: AlertTableConfig::default(),
            table_kv: KvTableConfig::default(),
        }
    }
}

impl SqlStorageConfig {
    fn validate(&self, kind: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config(format!("{kind} storage name must not be empty")));
        }
        if self.name == MEMORY_STORAGE {
            return Err(Error::config(format!(
                "storage name '{MEMORY_STORAGE}' is reserved"
            )));
        }

        let scheme_ok = match kind {
            "sqlite" => self.url.starts_with("sqlite:"),
            _ => self.url.starts_with("postgres://") || self.url.starts_with("postgresql://"),
        };
        if !scheme_ok {
            return Err(Error::config(format!(
                "{kind} storage '{}' has an invalid url",
                self.name
            )));
        }

        if self.timeout.is_zero() {
            return Err(Error::config(format!(
                "storage '{}' timeout must be positive",
                self.name
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::config(format!(
                "storage '{}' max_connections must be positive",
                self.name
            )));
        }

        let fields = &self.table_alerts.fields;
        let kv_fields = &self.table_kv.fields;
        let identifiers = [
            &self.table_alerts.table,
            &fields.id,
            &fields.level,
            &fields.count,
            &fields.updated_at,
            &fields.created_at,
            &self.table_kv.table,
            &kv_fields.key,
            &kv_fields.value,
        ];
        for ident in identifiers {
            if !is_valid_identifier(ident) {
                return Err(Error::config(format!(
                    "storage '{}' has invalid sql identifier '{ident}'",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Alerts table layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertTableConfig {
    /// Table name
    pub table: String,
    /// Create the table on startup if missing
    pub create_table: bool,
    /// Column names
    pub fields: AlertFieldsConfig,
}

impl Default for AlertTableConfig {
    fn default() -> Self {
        Self {
            table: "alerts".to_string(),
            create_table: true,
            fields: AlertFieldsConfig::default(),
        }
    }
}

/// Column names of the alerts table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFieldsConfig {
    /// Unique alert name
    pub id: String,
    /// Level code
    pub level: String,
    /// Consecutive count
    pub count: String,
    /// Last update, unix milliseconds
    pub updated_at: String,
    /// Creation, unix milliseconds
    pub created_at: String,
}

impl Default for AlertFieldsConfig {
    fn default() -> Self {
        Self {
            id: "id".to_string(),
            level: "level".to_string(),
            count: "count".to_string(),
            updated_at: "updated_at".to_string(),
            created_at: "created_at".to_string(),
        }
    }
}

/// KV table layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvTableConfig {
    /// Table name
    pub table: String,
    /// Create the table on startup if missing
    pub create_table: bool,
    /// Column names
    pub fields: KvFieldsConfig,
}

impl Default for KvTableConfig {
    fn default() -> Self {
        Self {
            table: "kv".to_string(),
            create_table: true,
            fields: KvFieldsConfig::default(),
        }
    }
}

/// Column names of the KV table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvFieldsConfig {
    /// Key column
    pub key: String,
    /// Value column
    pub value: String,
}

impl Default for KvFieldsConfig {
    fn default() -> Self {
        Self {
            key: "kv_key".to_string(),
            value: "kv_value".to_string(),
        }
    }
}

/// Notification channels, grouped by provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Channels writing to the process log
    pub log: Vec<LogChannelConfig>,
    /// Channels posting JSON to an HTTP endpoint
    pub webhook: Vec<WebhookChannelConfig>,
}

/// Log channel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogChannelConfig {
    /// Channel name
    pub name: String,
    /// Only used when requested by name
    pub ignore: bool,
}

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookChannelConfig {
    /// Channel name
    pub name: String,
    /// Target URL
    pub url: String,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Only used when requested by name
    pub ignore: bool,
}

impl Default for WebhookChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(10),
            ignore: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
