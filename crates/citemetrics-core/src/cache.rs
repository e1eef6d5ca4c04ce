//! Two-tier TTL cache partitioned into three domains.
//!
//! **L1** – [`DashMap`] in-memory map.
//! **L2** – Optional SQLite database on disk (persists across process restarts).
//!
//! On [`get`](CacheStore::get): check L1 first; on miss, fall through to L2 and
//! promote the row back into L1. On [`put`](CacheStore::put): write-through to
//! both tiers. An L2 write is a single `INSERT OR REPLACE`, so a crash never
//! leaves a half-written entry.
//!
//! | Domain     | Key               | Default TTL |
//! |------------|-------------------|-------------|
//! | `http`     | method + URL      | 30 days     |
//! | `metadata` | DOI               | never       |
//! | `metrics`  | `<kind>:<doi>`    | 14 days     |
//!
//! An entry is expired once `now >= expires_at`; a read at exactly the
//! expiry instant is a miss.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde_json::Value;

use crate::CoreError;
use crate::clock::Clock;

const DAY: u64 = 24 * 60 * 60;

/// File name of the SQLite store inside the cache directory.
pub const CACHE_DB_FILE: &str = "citemetrics-cache.sqlite3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheDomain {
    Http,
    Metadata,
    Metrics,
}

impl CacheDomain {
    pub const ALL: [CacheDomain; 3] = [Self::Http, Self::Metadata, Self::Metrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Metadata => "metadata",
            Self::Metrics => "metrics",
        }
    }

    /// `None` means the entry never expires.
    pub fn default_ttl(&self) -> Option<Duration> {
        match self {
            Self::Http => Some(Duration::from_secs(30 * DAY)),
            Self::Metadata => None,
            Self::Metrics => Some(Duration::from_secs(14 * DAY)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Time since the entry was written.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or_default()
    }
}

/// Open a SQLite connection with WAL mode and standard pragmas.
fn open_sqlite(path: &Path, read_only: bool) -> Result<Connection, rusqlite::Error> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn to_epoch(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

type Row = (String, String, i64, Option<i64>);

fn row_to_entry((key, payload, fetched_at, expires_at): Row) -> Option<CacheEntry> {
    Some(CacheEntry {
        key,
        payload: serde_json::from_str(&payload).ok()?,
        fetched_at: from_epoch(fetched_at),
        expires_at: expires_at.map(from_epoch),
    })
}

/// SQLite writer connection (L2 writes).
struct SqliteWriter {
    conn: Connection,
}

impl SqliteWriter {
    fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = open_sqlite(path, false)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                 domain      TEXT NOT NULL,
                 key         TEXT NOT NULL,
                 payload     TEXT NOT NULL,
                 fetched_at  INTEGER NOT NULL,
                 expires_at  INTEGER,
                 PRIMARY KEY (domain, key)
             );",
        )?;
        Ok(Self { conn })
    }

    fn put(&self, domain: CacheDomain, entry: &CacheEntry) -> Result<(), CoreError> {
        let payload = serde_json::to_string(&entry.payload)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries (domain, key, payload, fetched_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                domain.as_str(),
                entry.key,
                payload,
                to_epoch(entry.fetched_at),
                entry.expires_at.map(to_epoch)
            ],
        )?;
        Ok(())
    }

    fn remove(&self, domain: CacheDomain, key: &str) -> Result<(), CoreError> {
        self.conn.execute(
            "DELETE FROM cache_entries WHERE domain = ?1 AND key = ?2",
            params![domain.as_str(), key],
        )?;
        Ok(())
    }

    fn evict_expired(&self, domain: CacheDomain, now: DateTime<Utc>) -> usize {
        self.conn
            .execute(
                "DELETE FROM cache_entries
                 WHERE domain = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![domain.as_str(), to_epoch(now)],
            )
            .unwrap_or(0)
    }
}

/// Pool of read-only SQLite connections for L2 lookups.
struct ReadPool {
    pool: Mutex<Vec<Connection>>,
    path: PathBuf,
}

impl ReadPool {
    fn new(path: &Path) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            path: path.to_path_buf(),
        }
    }

    fn acquire(&self) -> Option<Connection> {
        if let Ok(mut pool) = self.pool.lock()
            && let Some(conn) = pool.pop()
        {
            return Some(conn);
        }
        open_sqlite(&self.path, true).ok()
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(conn);
        }
    }

    fn get(&self, domain: CacheDomain, key: &str) -> Option<CacheEntry> {
        let conn = self.acquire()?;
        let row: Result<Option<Row>, rusqlite::Error> = conn
            .prepare_cached(
                "SELECT key, payload, fetched_at, expires_at
                 FROM cache_entries WHERE domain = ?1 AND key = ?2",
            )
            .and_then(|mut stmt| {
                stmt.query_row(params![domain.as_str(), key], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .optional()
            });
        self.release(conn);
        row.ok().flatten().and_then(row_to_entry)
    }

    fn list(&self, domain: CacheDomain) -> Vec<CacheEntry> {
        let Some(conn) = self.acquire() else {
            return Vec::new();
        };
        let rows: Result<Vec<Row>, rusqlite::Error> = conn
            .prepare_cached(
                "SELECT key, payload, fetched_at, expires_at
                 FROM cache_entries WHERE domain = ?1 ORDER BY key",
            )
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map(params![domain.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<Row>, _>>();
                rows
            });
        self.release(conn);
        rows.unwrap_or_default()
            .into_iter()
            .filter_map(row_to_entry)
            .collect()
    }
}

/// Thread-safe two-tier cache shared by the HTTP client, the metadata
/// source and the metrics service.
pub struct CacheStore {
    entries: DashMap<(CacheDomain, String), CacheEntry>,
    sqlite_writer: Option<Mutex<SqliteWriter>>,
    read_pool: Option<ReadPool>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// In-memory only, no persistence.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            sqlite_writer: None,
            read_pool: None,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open a persistent cache backed by a SQLite database at `path`.
    ///
    /// Expired HTTP entries are evicted on open. Expired metrics entries are
    /// kept: they are the last good value if a refresh gets blocked.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let writer = SqliteWriter::open(path)?;
        let evicted = writer.evict_expired(CacheDomain::Http, clock.now());
        if evicted > 0 {
            tracing::debug!(evicted, path = %path.display(), "evicted expired HTTP cache entries");
        }
        Ok(Self {
            entries: DashMap::new(),
            sqlite_writer: Some(Mutex::new(writer)),
            read_pool: Some(ReadPool::new(path)),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Open `<dir>/citemetrics-cache.sqlite3`.
    pub fn open_in_dir(dir: &Path, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        Self::open(&dir.join(CACHE_DB_FILE), clock)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Entry for `key`, whether or not it has expired.
    pub fn get_any(&self, domain: CacheDomain, key: &str) -> Option<CacheEntry> {
        let l1_key = (domain, key.to_string());
        if let Some(entry) = self.entries.get(&l1_key) {
            return Some(entry.clone());
        }
        let entry = self.read_pool.as_ref()?.get(domain, key)?;
        tracing::trace!(domain = domain.as_str(), key, "cache L2 hit, promoting to L1");
        self.entries.insert(l1_key, entry.clone());
        Some(entry)
    }

    /// Unexpired entry for `key`.
    pub fn get(&self, domain: CacheDomain, key: &str) -> Option<CacheEntry> {
        match self.get_any(domain, key) {
            Some(entry) if !entry.is_expired(self.clock.now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(domain = domain.as_str(), key, "cache hit");
                Some(entry)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(domain = domain.as_str(), key, "cache miss");
                None
            }
        }
    }

    /// Write `payload` under `key`, expiring after `ttl` (`None` = never).
    pub fn put(
        &self,
        domain: CacheDomain,
        key: &str,
        payload: Value,
        ttl: Option<Duration>,
    ) -> Result<CacheEntry, CoreError> {
        let now = self.clock.now();
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            fetched_at: now,
            expires_at,
        };

        if let Some(writer) = &self.sqlite_writer {
            let writer = writer
                .lock()
                .map_err(|_| CoreError::Config("cache writer lock poisoned".into()))?;
            writer.put(domain, &entry)?;
        }
        self.entries
            .insert((domain, key.to_string()), entry.clone());
        tracing::trace!(domain = domain.as_str(), key, "cache write");
        Ok(entry)
    }

    pub fn remove(&self, domain: CacheDomain, key: &str) -> Result<(), CoreError> {
        self.entries.remove(&(domain, key.to_string()));
        if let Some(writer) = &self.sqlite_writer {
            let writer = writer
                .lock()
                .map_err(|_| CoreError::Config("cache writer lock poisoned".into()))?;
            writer.remove(domain, key)?;
        }
        Ok(())
    }

    /// Every entry in `domain`, expired or not, ordered by key.
    pub fn entries(&self, domain: CacheDomain) -> Vec<CacheEntry> {
        if let Some(pool) = &self.read_pool {
            return pool.list(domain);
        }
        let mut entries: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == domain)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Drop expired entries of `domain` from both tiers.
    pub fn evict_expired(&self, domain: CacheDomain) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.entries.retain(|(d, _), entry| {
            if *d == domain && entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if let Some(writer) = &self.sqlite_writer
            && let Ok(writer) = writer.lock()
        {
            removed = removed.max(writer.evict_expired(domain, now));
        }
        removed
    }

    /// Return the cached payload for `key` if present and unexpired;
    /// otherwise call `fetch`, store its result with a fresh expiry and
    /// return it. `force_refresh` skips the read but still writes.
    ///
    /// Errors from `fetch` are returned and never cached.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        domain: CacheDomain,
        key: &str,
        ttl: Option<Duration>,
        force_refresh: bool,
        fetch: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: From<CoreError>,
    {
        if !force_refresh && let Some(entry) = self.get(domain, key) {
            return Ok(entry.payload);
        }
        let value = fetch().await?;
        self.put(domain, key, value.clone(), ttl)?;
        Ok(value)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn has_persistence(&self) -> bool {
        self.sqlite_writer.is_some()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("l1_entries", &self.entries.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .field("persistent", &self.has_persistence())
            .finish()
    }
}
