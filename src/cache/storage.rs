//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::entry::{CacheEntry, StoredResponse};
use crate::config::StrategyKind;

/// Trait for cache storage backends.
///
/// Each call is atomic per key; there are no cross-key transactions. Writes to the
/// same (partition, url) replace each other, last write wins.
pub trait CacheStorage: Send + Sync {
  /// Store an entry, replacing any previous entry for the same (partition, url).
  fn put(&self, entry: &CacheEntry) -> Result<()>;

  /// Get the entry for a URL in a partition.
  fn get(&self, partition: &str, url: &str) -> Result<Option<CacheEntry>>;

  /// Delete one entry. Returns whether it existed.
  fn delete(&self, partition: &str, url: &str) -> Result<bool>;

  /// Reset the insertion time of an entry without rewriting it.
  fn touch(&self, partition: &str, url: &str, at: DateTime<Utc>) -> Result<()>;

  /// URLs and insertion times in a partition, oldest first.
  fn entries_by_age(&self, partition: &str) -> Result<Vec<(String, DateTime<Utc>)>>;

  /// Names of all partitions holding at least one entry.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Drop a whole partition. Returns the number of entries removed.
  fn delete_partition(&self, partition: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as the process.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Number of entries in a partition.
  pub fn count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }
}

/// Schema for cache and sync queue tables.
const CACHE_SCHEMA: &str = r#"
-- Cached responses, one per (partition, url)
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    strategy TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(partition, cached_at);

-- Mutations made while offline, delivered in id order
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;

impl CacheStorage for SqliteStorage {
  fn put(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (partition, url, status, headers, body, strategy, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          entry.partition,
          entry.url,
          entry.response.status,
          headers,
          entry.response.body,
          entry.strategy.as_str(),
          format_datetime(entry.cached_at),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.url, e))?;

    Ok(())
  }

  fn get(&self, partition: &str, url: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, headers, body, strategy, cached_at FROM cache_entries
         WHERE partition = ? AND url = ?",
        params![partition, url],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", url, e))?;

    let Some((status, headers, body, strategy, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
    let strategy = StrategyKind::parse(&strategy)
      .ok_or_else(|| eyre!("Unknown strategy {:?} stored for {}", strategy, url))?;

    Ok(Some(CacheEntry {
      partition: partition.to_string(),
      url: url.to_string(),
      response: StoredResponse {
        status,
        headers,
        body,
      },
      strategy,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn delete(&self, partition: &str, url: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND url = ?",
        params![partition, url],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", url, e))?;
    Ok(removed > 0)
  }

  fn touch(&self, partition: &str, url: &str, at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE cache_entries SET cached_at = ? WHERE partition = ? AND url = ?",
        params![format_datetime(at), partition, url],
      )
      .map_err(|e| eyre!("Failed to touch cache entry {}: {}", url, e))?;
    Ok(())
  }

  fn entries_by_age(&self, partition: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, cached_at FROM cache_entries
         WHERE partition = ?
         ORDER BY cached_at, url",
      )
      .map_err(|e| eyre!("Failed to prepare age query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map(params![partition], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query entry ages: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(url, cached_at)| Ok((url, parse_datetime(&cached_at)?)))
      .collect()
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT partition FROM cache_entries ORDER BY partition")
      .map_err(|e| eyre!("Failed to prepare partition query: {}", e))?;

    let partitions = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query partitions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(partitions)
  }

  fn delete_partition(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))
  }
}

/// Fixed-width UTC timestamp, so text order matches time order.
pub(crate) fn format_datetime(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by `format_datetime`.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
