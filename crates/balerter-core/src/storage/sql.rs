//! SQL core storage (Postgres and SQLite through the sqlx Any driver)
//!
//! Alert creation is race-safe through the primary key on the id column
//! and `ON CONFLICT DO NOTHING`. Updating an existing alert reads and then
//! writes inside one transaction without a row lock: two concurrent updates
//! of the same alert can both observe the old level and both report the
//! transition. Alert evaluation is low frequency, so this window is
//! accepted rather than paying for serializable isolation.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::{debug, error, info};

use super::{is_valid_identifier, AlertStorage, CoreStorage, KvStorage};
use crate::config::{AlertTableConfig, KvTableConfig, SqlStorageConfig};
use crate::error::{Error, Result};
use crate::models::{Alert, Level, INITIAL_COUNT, TRANSITION_COUNT};

/// Storage instance backed by a SQL database
pub struct SqlStorage {
    name: String,
    pool: AnyPool,
    kv: SqlKv,
    alerts: SqlAlerts,
}

impl SqlStorage {
    /// Connect to the configured database and prepare its tables
    pub async fn connect(config: &SqlStorageConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        info!(storage = %config.name, "Connected to SQL storage");
        Self::with_pool(config, pool).await
    }

    /// Build on an existing pool
    pub async fn with_pool(config: &SqlStorageConfig, pool: AnyPool) -> Result<Self> {
        let deadline = Deadline {
            storage: config.name.clone(),
            timeout: config.timeout,
        };

        let alerts = SqlAlerts::new(pool.clone(), deadline.clone(), &config.table_alerts)?;
        let kv = SqlKv::new(pool.clone(), deadline, &config.table_kv)?;

        if config.table_alerts.create_table {
            sqlx::query(&alerts.queries.create).execute(&pool).await?;
            debug!(storage = %config.name, table = %config.table_alerts.table, "Ensured alerts table");
        }
        if config.table_kv.create_table {
            sqlx::query(&kv.queries.create).execute(&pool).await?;
            debug!(storage = %config.name, table = %config.table_kv.table, "Ensured kv table");
        }

        Ok(Self {
            name: config.name.clone(),
            pool,
            kv,
            alerts,
        })
    }
}

#[async_trait]
impl CoreStorage for SqlStorage {
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
        self.pool.close().await;
        info!(storage = %self.name, "SQL storage closed");
        Ok(())
    }
}

/// Per-instance deadline for every storage call
#[derive(Clone)]
struct Deadline {
    storage: String,
    timeout: Duration,
}

impl Deadline {
    async fn run<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ (Error::KeyExists(_) | Error::NotFound { .. }))) => Err(e),
            Ok(Err(e)) => Err(e.context(format!("storage '{}' {op}", self.storage))),
            Err(_) => Err(Error::Timeout(self.timeout)
                .context(format!("storage '{}' {op}", self.storage))),
        }
    }
}

fn check_identifiers(idents: &[&str]) -> Result<()> {
    match idents.iter().find(|i| !is_valid_identifier(i)) {
        Some(bad) => Err(Error::config(format!("invalid sql identifier '{bad}'"))),
        None => Ok(()),
    }
}

/// Timestamps are stored as RFC 3339 text with millisecond precision
fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn from_text(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::internal(format!("stored timestamp '{text}' is invalid: {e}")))
}

struct AlertQueries {
    create: String,
    insert: String,
    select_state: String,
    increment: String,
    transition: String,
    get: String,
    index: String,
    level: String,
    id: String,
}

struct SqlAlerts {
    pool: AnyPool,
    deadline: Deadline,
    queries: AlertQueries,
}

impl SqlAlerts {
    fn new(pool: AnyPool, deadline: Deadline, config: &AlertTableConfig) -> Result<Self> {
        let t = &config.table;
        let f = &config.fields;
        check_identifiers(&[
            t.as_str(),
            f.id.as_str(),
            f.level.as_str(),
            f.count.as_str(),
            f.updated_at.as_str(),
            f.created_at.as_str(),
        ])?;

        let columns = format!(
            "{}, {}, {}, {}, {}",
            f.id, f.level, f.count, f.updated_at, f.created_at
        );

        let queries = AlertQueries {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {t} (\
                 {} VARCHAR(255) NOT NULL PRIMARY KEY, \
                 {} BIGINT NOT NULL, \
                 {} BIGINT NOT NULL, \
                 {} VARCHAR(32) NOT NULL, \
                 {} VARCHAR(32) NOT NULL)",
                f.id, f.level, f.count, f.updated_at, f.created_at
            ),
            insert: format!(
                "INSERT INTO {t} ({columns}) VALUES ($1, $2, $3, $4, $5) ON CONFLICT ({}) DO NOTHING",
                f.id
            ),
            select_state: format!(
                "SELECT {}, {}, {} FROM {t} WHERE {} = $1",
                f.level, f.count, f.created_at, f.id
            ),
            increment: format!(
                "UPDATE {t} SET {c} = {c} + 1, {} = $1 WHERE {} = $2",
                f.updated_at,
                f.id,
                c = f.count
            ),
            transition: format!(
                "UPDATE {t} SET {} = $1, {} = $2, {} = $3 WHERE {} = $4",
                f.level, f.count, f.updated_at, f.id
            ),
            get: format!("SELECT {columns} FROM {t} WHERE {} = $1", f.id),
            index: format!("SELECT {columns} FROM {t}"),
            level: f.level.clone(),
            id: f.id.clone(),
        };

        Ok(Self {
            pool,
            deadline,
            queries,
        })
    }

    async fn update_in_tx(&self, name: &str, level: Level) -> Result<(Alert, bool)> {
        let mut tx = self.pool.begin().await?;

        match self.apply(&mut tx, name, level).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(alert = %name, error = %rollback_err, "Error rolling back alert update");
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Any>,
        name: &str,
        level: Level,
    ) -> Result<(Alert, bool)> {
        let now = Utc::now().trunc_subsecs(3);
        let now_text = to_text(now);

        let inserted = sqlx::query(&self.queries.insert)
            .bind(name)
            .bind(level.code())
            .bind(INITIAL_COUNT)
            .bind(now_text.as_str())
            .bind(now_text.as_str())
            .execute(&mut **tx)
            .await?;

        if inserted.rows_affected() > 0 {
            debug!(alert = %name, %level, "Created alert");
            return Ok((Alert::new(name, level, now), level != Level::Success));
        }

        let row = sqlx::query(&self.queries.select_state)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| {
                Error::internal(format!("alert '{name}' missing after insert conflict"))
            })?;

        let stored_level = Level::try_from(row.try_get::<i64, _>(0)?)?;
        let count: i64 = row.try_get(1)?;
        let start = from_text(&row.try_get::<String, _>(2)?)?;

        if stored_level == level {
            sqlx::query(&self.queries.increment)
                .bind(now_text.as_str())
                .bind(name)
                .execute(&mut **tx)
                .await?;

            return Ok((Alert::from_parts(name, level, count + 1, now, start), false));
        }

        sqlx::query(&self.queries.transition)
            .bind(level.code())
            .bind(TRANSITION_COUNT)
            .bind(now_text.as_str())
            .bind(name)
            .execute(&mut **tx)
            .await?;

        debug!(alert = %name, from = %stored_level, to = %level, "Alert level changed");
        Ok((
            Alert::from_parts(name, level, TRANSITION_COUNT, now, start),
            true,
        ))
    }
}

fn alert_from_row(row: &AnyRow) -> Result<Alert> {
    let name: String = row.try_get(0)?;
    let level = Level::try_from(row.try_get::<i64, _>(1)?)?;
    let count: i64 = row.try_get(2)?;
    let last_change = from_text(&row.try_get::<String, _>(3)?)?;
    let start = from_text(&row.try_get::<String, _>(4)?)?;
    Ok(Alert::from_parts(name, level, count, last_change, start))
}

impl SqlAlerts {
    async fn fetch(&self, name: &str) -> Result<Option<Alert>> {
        let row = sqlx::query(&self.queries.get)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn fetch_all(&self, levels: &[Level]) -> Result<Vec<Alert>> {
        let mut sql = self.queries.index.clone();
        if !levels.is_empty() {
            let placeholders: Vec<String> =
                (1..=levels.len()).map(|i| format!("${i}")).collect();
            sql.push_str(&format!(
                " WHERE {} IN ({})",
                self.queries.level,
                placeholders.join(", ")
            ));
        }
        sql.push_str(&format!(" ORDER BY {}", self.queries.id));

        let mut query = sqlx::query(&sql);
        for level in levels {
            query = query.bind(level.code());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(alert_from_row).collect()
    }
}

#[async_trait]
impl AlertStorage for SqlAlerts {
    async fn update(&self, name: &str, level: Level) -> Result<(Alert, bool)> {
        self.deadline
            .run("update alert", self.update_in_tx(name, level))
            .await
    }

    async fn get(&self, name: &str) -> Result<Option<Alert>> {
        self.deadline.run("get alert", self.fetch(name)).await
    }

    async fn index(&self, levels: &[Level]) -> Result<Vec<Alert>> {
        self.deadline.run("index alerts", self.fetch_all(levels)).await
    }
}

struct KvQueries {
    create: String,
    put: String,
    get: String,
    upsert: String,
    delete: String,
    all: String,
}

struct SqlKv {
    pool: AnyPool,
    deadline: Deadline,
    queries: KvQueries,
}

impl SqlKv {
    fn new(pool: AnyPool, deadline: Deadline, config: &KvTableConfig) -> Result<Self> {
        let t = &config.table;
        let k = &config.fields.key;
        let v = &config.fields.value;
        check_identifiers(&[t.as_str(), k.as_str(), v.as_str()])?;

        let queries = KvQueries {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {t} ({k} VARCHAR(255) NOT NULL PRIMARY KEY, {v} TEXT NOT NULL)"
            ),
            put: format!("INSERT INTO {t} ({k}, {v}) VALUES ($1, $2) ON CONFLICT ({k}) DO NOTHING"),
            get: format!("SELECT {v} FROM {t} WHERE {k} = $1"),
            upsert: format!(
                "INSERT INTO {t} ({k}, {v}) VALUES ($1, $2) ON CONFLICT ({k}) DO UPDATE SET {v} = excluded.{v}"
            ),
            delete: format!("DELETE FROM {t} WHERE {k} = $1"),
            all: format!("SELECT {k}, {v} FROM {t}"),
        };

        Ok(Self {
            pool,
            deadline,
            queries,
        })
    }

    /// Runs a keyed write and returns the affected row count
    async fn write(&self, sql: &str, key: &str, value: Option<&str>) -> Result<u64> {
        let mut query = sqlx::query(sql).bind(key);
        if let Some(value) = value {
            query = query.bind(value);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn insert(&self, key: &str, value: &str) -> Result<()> {
        if self.write(&self.queries.put, key, Some(value)).await? == 0 {
            return Err(Error::KeyExists(key.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.write(&self.queries.delete, key, None).await? == 0 {
            return Err(Error::not_found("key", key));
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<String> {
        let row = sqlx::query(&self.queries.get)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("key", key))?;
        Ok(row.try_get(0)?)
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(&self.queries.all).fetch_all(&self.pool).await?;
        let mut data = BTreeMap::new();
        for row in rows {
            data.insert(row.try_get(0)?, row.try_get(1)?);
        }
        Ok(data)
    }
}

#[async_trait]
impl KvStorage for SqlKv {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.deadline.run("put kv", self.insert(key, value)).await
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.deadline.run("get kv", self.read(key)).await
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        let written = self.write(&self.queries.upsert, key, Some(value));
        self.deadline.run("upsert kv", written).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deadline.run("delete kv", self.remove(key)).await
    }

    async fn all(&self) -> Result<BTreeMap<String, String>> {
        self.deadline.run("all kv", self.read_all()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sqlite_config(dir: &TempDir, name: &str) -> SqlStorageConfig {
        SqlStorageConfig {
            name: name.to_string(),
            url: format!("sqlite://{}?mode=rwc", dir.path().join("balerter.db").display()),
            ..SqlStorageConfig::default()
        }
    }

    async fn open(dir: &TempDir) -> SqlStorage {
        SqlStorage::connect(&sqlite_config(dir, "sqlite"))
            .await
            .unwrap()
    }

    async fn row_count(storage: &SqlStorage) -> i64 {
        sqlx::query("SELECT COUNT(*) FROM alerts")
            .fetch_one(&storage.pool)
            .await
            .unwrap()
            .try_get(0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_follows_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        let alerts = storage.alert();

        let (alert, changed) = alerts.update("svc", Level::Error).await.unwrap();
        assert!(changed);
        assert_eq!(alert.count(), INITIAL_COUNT);
        let start = alert.start();

        for expected in 2..=4 {
            let (alert, changed) = alerts.update("svc", Level::Error).await.unwrap();
            assert!(!changed);
            assert_eq!(alert.count(), expected);
        }

        let (alert, changed) = alerts.update("svc", Level::Success).await.unwrap();
        assert!(changed);
        assert_eq!(alert.count(), TRANSITION_COUNT);
        assert_eq!(alert.start(), start);

        let stored = alerts.get("svc").await.unwrap().unwrap();
        assert_eq!(stored, alert);
    }

    #[tokio::test]
    async fn test_new_success_alert_is_not_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;

        let (alert, changed) = storage.alert().update("ok", Level::Success).await.unwrap();
        assert!(!changed);
        assert_eq!(alert.level(), Level::Success);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;

        assert!(storage.alert().get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_filters_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        let alerts = storage.alert();

        assert!(alerts.all().await.unwrap().is_empty());

        alerts.update("b", Level::Warn).await.unwrap();
        alerts.update("a", Level::Error).await.unwrap();
        alerts.update("c", Level::Success).await.unwrap();

        let names: Vec<String> = alerts
            .index(&[Level::Warn, Level::Error])
            .await
            .unwrap()
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(alerts.all().await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_updates_create_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(open(&dir).await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = storage.clone();
                tokio::spawn(async move { storage.alert().update("race", Level::Warn).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(row_count(&storage).await, 1);
        let alert = storage.alert().get("race").await.unwrap().unwrap();
        assert!((1..=8).contains(&alert.count()));
    }

    #[tokio::test]
    async fn test_custom_table_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sqlite_config(&dir, "custom");
        config.table_alerts.table = "balerter_alerts".to_string();
        config.table_alerts.fields.id = "alert_name".to_string();
        config.table_alerts.fields.count = "occurrences".to_string();

        let storage = SqlStorage::connect(&config).await.unwrap();
        storage.alert().update("x", Level::Error).await.unwrap();
        storage.alert().update("x", Level::Error).await.unwrap();

        let count: i64 =
            sqlx::query("SELECT occurrences FROM balerter_alerts WHERE alert_name = 'x'")
                .fetch_one(&storage.pool)
                .await
                .unwrap()
                .try_get(0)
                .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_invalid_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sqlite_config(&dir, "bad");
        config.table_kv.fields.value = "v; --".to_string();

        let err = SqlStorage::connect(&config).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;

        let mut config = sqlite_config(&dir, "hasty");
        config.timeout = Duration::from_millis(50);
        let hasty = SqlStorage::connect(&config).await.unwrap();

        // hold the database write lock so the update cannot finish in time
        let mut locker = storage.pool.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *locker)
            .await
            .unwrap();

        let err = hasty.alert().update("slow", Level::Error).await.unwrap_err();
        assert!(matches!(err.root(), Error::Timeout(_)));

        sqlx::query("ROLLBACK").execute(&mut *locker).await.unwrap();
        drop(locker);
        hasty.stop().await.unwrap();

        assert!(storage.alert().get("slow").await.unwrap().is_none());
        assert_eq!(row_count(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_timestamps_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        let alerts = storage.alert();

        let (created, _) = alerts.update("x", Level::Error).await.unwrap();
        let now = Utc::now();
        assert!((now - created.start()).num_seconds().abs() < 1);

        let stored = alerts.get("x").await.unwrap().unwrap();
        assert_eq!(stored.start(), created.start());
        assert_eq!(stored.last_change(), created.last_change());
        assert!((now - stored.start()).num_seconds().abs() < 1);

        let (updated, _) = alerts.update("x", Level::Error).await.unwrap();
        assert_eq!(updated.start(), created.start());
        assert!(updated.last_change() >= created.last_change());

        let listed = alerts.all().await.unwrap();
        assert_eq!(listed[0].start(), created.start());
        assert_eq!(listed[0].last_change(), updated.last_change());
    }

    #[tokio::test]
    async fn test_corrupt_level_is_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        storage.alert().update("x", Level::Warn).await.unwrap();

        sqlx::query("UPDATE alerts SET level = 9 WHERE id = 'x'")
            .execute(&storage.pool)
            .await
            .unwrap();

        let err = storage.alert().get("x").await.unwrap_err();
        assert!(matches!(err.root(), Error::BadLevel(_)));

        let err = storage.alert().update("x", Level::Warn).await.unwrap_err();
        assert!(matches!(err.root(), Error::BadLevel(_)));
    }

    #[tokio::test]
    async fn test_kv_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        let kv = storage.kv();

        kv.put("a", "1").await.unwrap();
        assert!(matches!(kv.put("a", "2").await, Err(Error::KeyExists(_))));
        assert_eq!(kv.get("a").await.unwrap(), "1");

        kv.upsert("a", "3").await.unwrap();
        kv.upsert("b", "4").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), "3");

        let all = kv.all().await.unwrap();
        assert_eq!(all.get("b").map(String::as_str), Some("4"));
        assert_eq!(all.len(), 2);

        kv.delete("a").await.unwrap();
        assert!(matches!(kv.delete("a").await, Err(Error::NotFound { .. })));
        assert!(matches!(kv.get("a").await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_stop_closes_pool() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;

        storage.stop().await.unwrap();
        assert!(storage.pool.is_closed());
        assert!(storage.alert().get("x").await.is_err());
    }
}
