use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::OtuError;

pub const CACHE_7DAYS: Option<Duration> = Some(Duration::from_secs(60 * 60 * 24 * 7));
pub const CACHE_FOREVER: Option<Duration> = None;

pub trait CacheRepr {
    fn cache_repr(&self) -> String;
}

impl CacheRepr for &str {
    fn cache_repr(&self) -> String {
        self.to_string()
    }
}

impl CacheRepr for String {
    fn cache_repr(&self) -> String {
        self.clone()
    }
}

impl CacheRepr for Option<i64> {
    fn cache_repr(&self) -> String {
        match self {
            Some(value) => value.to_string(),
            None => "None".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetGeneration(String);

impl DatasetGeneration {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn cache_key(&self, args: &[&dyn CacheRepr]) -> String {
        let parts: Vec<String> = args.iter().map(|arg| arg.cache_repr()).collect();
        let key = format!("{}:{}", self.0, parts.join(":"));
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

impl fmt::Display for DatasetGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ResultCache for NoCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) {}
}

pub const MEMORY_CACHE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires: Option<SystemTime>,
    inserted: u64,
}

/// In-process cache holding at most `capacity` entries. Expired entries are
/// swept on every write; when still full, the oldest write is evicted.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    capacity: usize,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            writes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "memory cache poisoned");
                return None;
            }
        };
        let now = SystemTime::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let now = SystemTime::now();
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "memory cache poisoned");
                return;
            }
        };
        entries.retain(|_, entry| !entry.is_expired(now));
        while entries.len() >= self.capacity && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(name, _)| name.clone());
            match oldest {
                Some(oldest) => entries.remove(&oldest),
                None => break,
            };
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires: ttl.map(|ttl| now + ttl),
                inserted: self.writes.fetch_add(1, Ordering::Relaxed),
            },
        );
    }
}

pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(path: &Utf8Path) -> Result<Self, OtuError> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| OtuError::Filesystem(err.to_string()))?;
            }
        }
        let conn = Connection::open(path.as_std_path())
            .map_err(|err| OtuError::Cache(format!("open {path}: {err}")))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, OtuError> {
        let conn = Connection::open_in_memory().map_err(|err| OtuError::Cache(err.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, OtuError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );
            "#,
        )
        .map_err(|err| OtuError::Cache(err.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, OtuError> {
        let conn = self
            .conn
            .lock()
            .map_err(|err| OtuError::Cache(err.to_string()))?;
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| OtuError::Cache(err.to_string()))?;
        match row {
            Some((_, Some(expires_at))) if expires_at <= unix_now() => {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", [key])
                    .map_err(|err| OtuError::Cache(err.to_string()))?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn store(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), OtuError> {
        let expires_at = ttl.map(|ttl| unix_now() + ttl.as_secs() as i64);
        let conn = self
            .conn
            .lock()
            .map_err(|err| OtuError::Cache(err.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )
        .map_err(|err| OtuError::Cache(err.to_string()))?;
        Ok(())
    }
}

impl ResultCache for SqliteCache {
    fn get(&self, key: &str) -> Option<String> {
        match self.lookup(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "cache read failed; recomputing");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        if let Err(err) = self.store(key, value, ttl) {
            warn!(error = %err, "cache write failed");
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_depend_on_generation_and_every_argument() {
        let generation = DatasetGeneration::new("a1b2");
        let key = generation.cache_key(&[&"matching_samples", &"SELECT 1"]);
        assert_eq!(key.len(), 64);
        assert_eq!(key, generation.cache_key(&[&"matching_samples", &"SELECT 1"]));
        assert_ne!(key, generation.cache_key(&[&"matching_samples", &"SELECT 2"]));
        assert_ne!(
            key,
            DatasetGeneration::new("c3d4").cache_key(&[&"matching_samples", &"SELECT 1"])
        );
    }

    #[test]
    fn key_is_sha256_of_joined_representation() {
        let generation = DatasetGeneration::new("gen");
        let expected = hex::encode(Sha256::digest(b"gen:x:None"));
        assert_eq!(generation.cache_key(&[&"x", &None::<i64>]), expected);
    }

    #[test]
    fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.set("a", "1", CACHE_FOREVER);
        cache.set("b", "2", Some(Duration::ZERO));
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn memory_cache_sweeps_and_stays_bounded() {
        let cache = MemoryCache::with_capacity(2);
        cache.set("stale", "0", Some(Duration::ZERO));
        cache.set("a", "1", CACHE_FOREVER);
        assert_eq!(cache.len(), 1);

        cache.set("b", "2", CACHE_FOREVER);
        cache.set("c", "3", CACHE_FOREVER);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c").as_deref(), Some("3"));

        cache.set("c", "4", CACHE_FOREVER);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }

    #[test]
    fn sqlite_cache_round_trips_and_replaces() {
        let cache = SqliteCache::in_memory().unwrap();
        assert_eq!(cache.get("k"), None);
        cache.set("k", "first", CACHE_7DAYS);
        cache.set("k", "second", CACHE_7DAYS);
        assert_eq!(cache.get("k").as_deref(), Some("second"));
    }

    #[test]
    fn no_cache_never_hits() {
        NoCache.set("k", "v", CACHE_FOREVER);
        assert_eq!(NoCache.get("k"), None);
    }
}
