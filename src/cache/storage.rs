//! SQLite-backed persistence for cache entries.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use super::traits::{checksum, CacheEntry, CacheSource, CacheStorage, Payload};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// In-memory database, mostly useful for tests.
  pub fn open_in_memory() -> Result<Self> {
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

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dataset_cache (
    cache_key TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    data BLOB NOT NULL,
    checksum TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    stale_at INTEGER NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn load_all(&self) -> Result<Vec<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT cache_key, source_id, origin, data, checksum, fetched_at, stale_at
         FROM dataset_cache",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<StoredRow> = stmt
      .query_map([], |row| {
        Ok(StoredRow {
          key: row.get(0)?,
          source_id: row.get(1)?,
          origin: row.get(2)?,
          data: row.get(3)?,
          checksum: row.get(4)?,
          fetched_at: row.get(5)?,
          stale_at: row.get(6)?,
        })
      })
      .map_err(|e| eyre!("Failed to query cache: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(rows.into_iter().filter_map(StoredRow::into_entry).collect())
  }

  fn store(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT INTO dataset_cache (cache_key, source_id, origin, data, checksum, fetched_at, stale_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(cache_key) DO UPDATE SET
           source_id = excluded.source_id,
           origin = excluded.origin,
           data = excluded.data,
           checksum = excluded.checksum,
           fetched_at = excluded.fetched_at,
           stale_at = excluded.stale_at
         WHERE excluded.fetched_at >= dataset_cache.fetched_at",
        params![
          entry.key,
          entry.source_id,
          entry.origin.as_str(),
          entry.payload.to_bytes(),
          entry.checksum,
          entry.fetched_at.timestamp_millis(),
          entry.stale_at.timestamp_millis(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key, e))?;

    Ok(())
  }

  fn remove(&self, key: Option<&str>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match key {
      Some(key) => conn.execute("DELETE FROM dataset_cache WHERE cache_key = ?", params![key]),
      None => conn.execute("DELETE FROM dataset_cache", []),
    }
    .map_err(|e| eyre!("Failed to remove cache entries: {}", e))?;

    Ok(())
  }
}

struct StoredRow {
  key: String,
  source_id: String,
  origin: String,
  data: Vec<u8>,
  checksum: String,
  fetched_at: i64,
  stale_at: i64,
}

impl StoredRow {
  /// Rebuild an entry, dropping rows that are corrupt.
  fn into_entry(self) -> Option<CacheEntry> {
    if checksum(&self.data) != self.checksum {
      warn!(key = %self.key, "Discarding persisted entry with checksum mismatch");
      return None;
    }

    let payload = match Payload::parse(&self.data) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(key = %self.key, error = %e, "Discarding unreadable persisted entry");
        return None;
      }
    };

    Some(CacheEntry {
      origin: CacheSource::parse(&self.origin)?,
      fetched_at: from_millis(self.fetched_at)?,
      stale_at: from_millis(self.stale_at)?,
      key: self.key,
      source_id: self.source_id,
      payload,
      checksum: self.checksum,
    })
  }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
  Utc.timestamp_millis_opt(millis).single()
}
