use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How long a save waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// A stored value and its version tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateItem {
    /// The stored JSON document.
    pub value: serde_json::Value,
    /// Version tag; changes on every successful save.
    pub etag: String,
}

/// Precondition for a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition<'a> {
    /// Last write wins.
    Any,
    /// The key must currently carry this etag.
    Etag(&'a str),
    /// The key must not exist yet.
    Missing,
}

/// A [`WriteCondition`] that can move into a blocking task.
enum Precondition {
    Any,
    Etag(String),
    Missing,
}

impl From<WriteCondition<'_>> for Precondition {
    fn from(condition: WriteCondition<'_>) -> Self {
        match condition {
            WriteCondition::Any => Precondition::Any,
            WriteCondition::Etag(tag) => Precondition::Etag(tag.to_string()),
            WriteCondition::Missing => Precondition::Missing,
        }
    }
}

impl Precondition {
    /// `live` is the version of the key, `None` when it does not exist.
    fn check(&self, key: &str, live: Option<u64>) -> ConclaveResult<()> {
        let ok = match (self, live) {
            (Precondition::Any, _) => true,
            (Precondition::Missing, None) => true,
            (Precondition::Missing, Some(_)) => false,
            (Precondition::Etag(_), None) => false,
            (Precondition::Etag(expected), Some(version)) => *expected == version.to_string(),
        };
        if ok {
            Ok(())
        } else {
            Err(ConclaveError::State(format!("etag mismatch for key '{key}'")))
        }
    }
}

/// Key/value store shared between services.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store name (e.g. `agentsregistrystore`).
    fn name(&self) -> &str;

    /// Reads a key.
    async fn get(&self, key: &str) -> ConclaveResult<Option<StateItem>>;

    /// Writes a key if `condition` holds. Returns the new etag.
    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition<'_>,
    ) -> ConclaveResult<String>;

    /// Removes a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> ConclaveResult<()>;
}

/// Reads and deserializes a key, returning the value with its etag.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> ConclaveResult<Option<(T, String)>> {
    match store.get(key).await? {
        Some(item) => {
            let value = serde_json::from_value(item.value).map_err(|e| {
                ConclaveError::State(format!(
                    "failed to decode key '{key}' in store '{}': {e}",
                    store.name()
                ))
            })?;
            Ok(Some((value, item.etag)))
        }
        None => Ok(None),
    }
}

/// Serializes and writes a key unconditionally.
pub async fn save_json<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> ConclaveResult<String> {
    store
        .save(key, serde_json::to_value(value)?, WriteCondition::Any)
        .await
}

/// Volatile store for single-process deployments and tests.
///
/// Deleted keys leave a tombstone holding their last version, so an etag
/// handed out before a delete never matches again.
pub struct InMemoryStateStore {
    name: String,
    items: RwLock<HashMap<String, (Option<serde_json::Value>, u64)>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> ConclaveResult<Option<StateItem>> {
        Ok(self.items.read().get(key).and_then(|(value, version)| {
            value.as_ref().map(|value| StateItem {
                value: value.clone(),
                etag: version.to_string(),
            })
        }))
    }

    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition<'_>,
    ) -> ConclaveResult<String> {
        let mut items = self.items.write();
        let stored = items.get(key).map(|(_, version)| *version);
        let live = items
            .get(key)
            .and_then(|(value, version)| value.as_ref().map(|_| *version));
        Precondition::from(condition).check(key, live)?;
        let version = stored.unwrap_or(0) + 1;
        items.insert(key.to_string(), (Some(value), version));
        Ok(version.to_string())
    }

    async fn delete(&self, key: &str) -> ConclaveResult<()> {
        if let Some((value, version)) = self.items.write().get_mut(key) {
            if value.take().is_some() {
                *version += 1;
            }
        }
        Ok(())
    }
}

fn sql_error(e: rusqlite::Error) -> ConclaveError {
    ConclaveError::State(format!("sqlite: {e}"))
}

fn open_database(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS state (
            key     TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            value   TEXT
        )",
    )?;
    Ok(conn)
}

fn version_of(raw: i64) -> ConclaveResult<u64> {
    u64::try_from(raw).map_err(|_| ConclaveError::State(format!("negative version {raw}")))
}

/// Store backed by one SQLite database per store, `<dir>/<store name>.db`.
///
/// Every process sharing `dir` sees the same keys. Saves check the etag and
/// write inside one `IMMEDIATE` transaction, so the condition holds across
/// processes. Deleted keys keep their version, and a later save continues
/// from it.
pub struct SqliteStateStore {
    name: String,
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Opens (and creates) the database for store `name` under `dir`.
    pub async fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> ConclaveResult<Self> {
        let name = name.into();
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{name}.db"));
        let conn = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || open_database(&path))
                .await
                .map_err(|e| ConclaveError::State(format!("opening store failed: {e}")))?
                .map_err(sql_error)?
        };
        debug!(store = %name, path = %path.display(), "Opened state database");
        Ok(Self {
            name,
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Database file backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, op: F) -> ConclaveResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> ConclaveResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || op(&mut conn.lock()))
            .await
            .map_err(|e| ConclaveError::State(format!("state task failed: {e}")))?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> ConclaveResult<Option<StateItem>> {
        let key = key.to_string();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT version, value FROM state WHERE key = ?1 AND value IS NOT NULL",
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .map_err(sql_error)
            })
            .await?;
        row.map(|(version, text)| -> ConclaveResult<StateItem> {
            Ok(StateItem {
                value: serde_json::from_str(&text)?,
                etag: version_of(version)?.to_string(),
            })
        })
        .transpose()
    }

    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition<'_>,
    ) -> ConclaveResult<String> {
        let key = key.to_string();
        let text = serde_json::to_string(&value)?;
        let expected = Precondition::from(condition);
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error)?;
            let row = tx
                .query_row(
                    "SELECT version, value IS NOT NULL FROM state WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()
                .map_err(sql_error)?;
            let stored = row.map(|(version, _)| version_of(version)).transpose()?;
            let live = match row {
                Some((_, true)) => stored,
                _ => None,
            };
            expected.check(&key, live)?;

            let version = stored.unwrap_or(0) + 1;
            let raw = i64::try_from(version)
                .map_err(|_| ConclaveError::State(format!("version overflow for key '{key}'")))?;
            tx.execute(
                "INSERT INTO state (key, version, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET version = excluded.version, value = excluded.value",
                params![key, raw, text],
            )
            .map_err(sql_error)?;
            tx.commit().map_err(sql_error)?;
            Ok(version.to_string())
        })
        .await
    }

    async fn delete(&self, key: &str) -> ConclaveResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE state SET value = NULL, version = version + 1
                 WHERE key = ?1 AND value IS NOT NULL",
                params![key],
            )
            .map_err(sql_error)?;
            Ok(())
        })
        .await
    }
}
