use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// How long a writer waits for another connection's lock on the same file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Closure handed to [`LocalStore::update`]. Receives the current value and
/// returns the replacement, or `None` to leave the key untouched.
pub type UpdateFn<'a> = dyn FnMut(Option<String>) -> Result<Option<String>, SyncError> + 'a;

/// Synchronous key-value storage that survives process restarts.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;
    fn remove(&self, key: &str) -> Result<(), SyncError>;

    /// Read-modify-write `key` atomically with respect to every other writer
    /// of the same storage, including other handles on the same file.
    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> Result<(), SyncError>;
}

/// SQLite-backed store. All values live in the `sync_kv` table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Take ownership of an existing connection and create the metadata tables.
    pub fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// Safe to call multiple times.
    fn init_schema(&self) -> Result<(), SyncError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS sync_kv (
k TEXT PRIMARY KEY,
v TEXT NOT NULL
);
"#,
        )?;
        conn.execute(
            "INSERT INTO sync_kv(k,v) VALUES('schema_version','1')
ON CONFLICT(k) DO NOTHING",
            [],
        )?;
        Ok(())
    }

    /// Return the integer schema version stored in `sync_kv`.
    pub fn schema_version(&self) -> Result<i32, SyncError> {
        let ver: Option<String> = self
            .lock()?
            .query_row("SELECT v FROM sync_kv WHERE k='schema_version'", [], |r| r.get(0))
            .optional()?;
        Ok(ver.and_then(|s| s.parse::<i32>().ok()).unwrap_or(1))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SyncError> {
        self.conn.lock().map_err(|_| SyncError::State("sqlite connection lock poisoned"))
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let v = self
            .lock()?
            .query_row("SELECT v FROM sync_kv WHERE k=?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.lock()?.execute(
            "INSERT INTO sync_kv(k,v) VALUES(?1,?2)
ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.lock()?.execute("DELETE FROM sync_kv WHERE k=?1", params![key])?;
        Ok(())
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> Result<(), SyncError> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so two connections cannot
        // both read the old value.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row("SELECT v FROM sync_kv WHERE k=?1", params![key], |r| r.get(0))
            .optional()?;
        if let Some(next) = f(current)? {
            tx.execute(
                "INSERT INTO sync_kv(k,v) VALUES(?1,?2)
ON CONFLICT(k) DO UPDATE SET v=excluded.v",
                params![key, next],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Process-local store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, SyncError> {
        self.entries.lock().map_err(|_| SyncError::State("memory store lock poisoned"))
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let entries = self.lock()?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        let mut entries = self.lock()?;
        entries.remove(key);
        Ok(())
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> Result<(), SyncError> {
        let mut entries = self.lock()?;
        if let Some(next) = f(entries.get(key).cloned())? {
            entries.insert(key.to_string(), next);
        }
        Ok(())
    }
}

/// View of another store whose keys are prefixed with an owner, so several
/// accounts can share one database file without seeing each other's queue
/// or caches.
pub struct ScopedStore {
    inner: Arc<dyn LocalStore>,
    prefix: String,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn LocalStore>, owner: &str) -> Self {
        Self { inner, prefix: format!("{owner}/") }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl LocalStore for ScopedStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        self.inner.get(&self.key(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.inner.set(&self.key(key), value)
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.inner.remove(&self.key(key))
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> Result<(), SyncError> {
        self.inner.update(&self.key(key), f)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: ?Sized> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Serialize `data` under `key` tagged with `version`.
pub(crate) fn write_versioned<T: Serialize + ?Sized>(
    store: &dyn LocalStore,
    key: &str,
    version: u32,
    data: &T,
) -> Result<(), SyncError> {
    store.set(key, &encode_versioned(version, data)?)
}

pub(crate) fn encode_versioned<T: Serialize + ?Sized>(
    version: u32,
    data: &T,
) -> Result<String, SyncError> {
    Ok(serde_json::to_string(&EnvelopeRef { version, data })?)
}

/// Read a value written by [`write_versioned`]. A missing key yields `None`.
pub(crate) fn read_versioned<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
    version: u32,
) -> Result<Option<T>, SyncError> {
    match store.get(key)? {
        Some(raw) => decode_versioned(key, &raw, version).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn decode_versioned<T: DeserializeOwned>(
    key: &str,
    raw: &str,
    version: u32,
) -> Result<T, SyncError> {
    let corrupted = |source| SyncError::Corrupted { key: key.to_string(), source };
    let probe: VersionProbe = serde_json::from_str(raw).map_err(corrupted)?;
    if probe.version != version {
        return Err(SyncError::UnsupportedVersion {
            key: key.to_string(),
            found: probe.version,
            expected: version,
        });
    }
    let envelope: Envelope<T> = serde_json::from_str(raw).map_err(corrupted)?;
    Ok(envelope.data)
}
