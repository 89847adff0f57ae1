//! Blob store and sync log implementations: SQLite and in-memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::traits::{BlobStore, CachedEntry};
use crate::net::Response;
use crate::sync::{SyncTask, TaskLog};

/// SQLite-based storage for tiers and the sync queue.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
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

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named partitions
CREATE TABLE IF NOT EXISTS tiers (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One response per (tier, key)
CREATE TABLE IF NOT EXISTS entries (
    tier TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (tier, key)
);

-- Deferred mutating requests, replayed in id order
CREATE TABLE IF NOT EXISTS sync_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at TEXT NOT NULL
);
"#;

impl BlobStore for SqliteStorage {
  fn open_tier(&self, tier: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("INSERT OR IGNORE INTO tiers (name) VALUES (?)", params![tier])
      .map_err(|e| eyre!("Failed to open tier {}: {}", tier, e))?;
    Ok(())
  }

  fn get(&self, tier: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries WHERE tier = ? AND key = ?",
        params![tier, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from tier {}: {}", key, tier, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute("INSERT OR IGNORE INTO tiers (name) VALUES (?)", params![tier])
      .map_err(|e| eyre!("Failed to open tier {}: {}", tier, e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO entries (tier, key, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![tier, key, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store {} in tier {}: {}", key, tier, e))?;

    Ok(())
  }

  fn delete(&self, tier: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM entries WHERE tier = ? AND key = ?",
        params![tier, key],
      )
      .map_err(|e| eyre!("Failed to delete {} from tier {}: {}", key, tier, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM entries WHERE tier = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![tier], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list tier {}: {}", tier, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list tier {}: {}", tier, e))?;

    Ok(keys)
  }

  fn tiers(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT name FROM tiers
         UNION SELECT DISTINCT tier FROM entries
         ORDER BY 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tiers = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list tiers: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list tiers: {}", e))?;

    Ok(tiers)
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let entries = tx
      .execute("DELETE FROM entries WHERE tier = ?", params![tier])
      .map_err(|e| eyre!("Failed to delete entries of tier {}: {}", tier, e))?;
    let named = tx
      .execute("DELETE FROM tiers WHERE name = ?", params![tier])
      .map_err(|e| eyre!("Failed to delete tier {}: {}", tier, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(entries > 0 || named > 0)
  }
}

impl TaskLog for SqliteStorage {
  fn append(&self, task: &SyncTask) -> Result<i64> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&task.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_tasks (method, url, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          task.method,
          task.url,
          headers,
          task.body,
          task.enqueued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue sync task: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn list(&self) -> Result<Vec<SyncTask>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT id, method, url, headers, body, enqueued_at FROM sync_tasks ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, body, enqueued_at)| -> Result<SyncTask> {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of task {}: {}", id, e))?;
        let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
          .map_err(|e| eyre!("Failed to parse enqueue time of task {}: {}", id, e))?
          .with_timezone(&Utc);
        Ok(SyncTask {
          id,
          method,
          url,
          headers,
          body,
          enqueued_at,
        })
      })
      .collect()
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM sync_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync task {}: {}", id, e))?;
    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Storage that keeps everything in process memory.
/// Used for ephemeral agents and tests.
#[derive(Default)]
pub struct MemoryStorage {
  tiers: Mutex<BTreeMap<String, BTreeMap<String, CachedEntry>>>,
  tasks: Mutex<(i64, Vec<SyncTask>)>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn tiers_lock(
    &self,
  ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, CachedEntry>>>> {
    self.tiers.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl BlobStore for MemoryStorage {
  fn open_tier(&self, tier: &str) -> Result<()> {
    self.tiers_lock()?.entry(tier.to_string()).or_default();
    Ok(())
  }

  fn get(&self, tier: &str, key: &str) -> Result<Option<CachedEntry>> {
    Ok(
      self
        .tiers_lock()?
        .get(tier)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<()> {
    self.tiers_lock()?.entry(tier.to_string()).or_default().insert(
      key.to_string(),
      CachedEntry {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn delete(&self, tier: &str, key: &str) -> Result<bool> {
    Ok(
      self
        .tiers_lock()?
        .get_mut(tier)
        .and_then(|entries| entries.remove(key))
        .is_some(),
    )
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    Ok(
      self
        .tiers_lock()?
        .get(tier)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn tiers(&self) -> Result<Vec<String>> {
    Ok(self.tiers_lock()?.keys().cloned().collect())
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    Ok(self.tiers_lock()?.remove(tier).is_some())
  }
}

impl TaskLog for MemoryStorage {
  fn append(&self, task: &SyncTask) -> Result<i64> {
    let mut tasks = self.tasks.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    tasks.0 += 1;
    let id = tasks.0;
    tasks.1.push(SyncTask { id, ..task.clone() });
    Ok(id)
  }

  fn list(&self) -> Result<Vec<SyncTask>> {
    let tasks = self.tasks.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(tasks.1.clone())
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let mut tasks = self.tasks.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = tasks.1.len();
    tasks.1.retain(|task| task.id != id);
    Ok(tasks.1.len() != before)
  }
}
