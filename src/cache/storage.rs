//! Cache storage trait and SQLite implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::traits::{CacheKey, CachedResponse};
use crate::http::{Response, ResponseSource};

/// Trait for partition storage backends.
///
/// Implementations must tolerate concurrent callers. Writes to the same key
/// are last-write-wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Drop a partition and every entry in it. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Names of all existing partitions, oldest first.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Number of entries held by a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;

  /// Look up an entry in one partition.
  fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedResponse>>;

  /// Look up an entry in any partition, searching oldest partitions first.
  fn get_any(&self, key: &CacheKey) -> Result<Option<CachedResponse>>;

  /// Store (or overwrite) an entry, creating the partition if needed.
  fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()>;

  /// Store a batch of entries atomically: either all of them land or none.
  fn put_many(&self, partition: &str, entries: &[(CacheKey, Response)]) -> Result<()>;

  /// Version id recorded by the last successful activation.
  fn active_version(&self) -> Result<Option<String>>;

  /// Record the version id of a completed activation.
  fn set_active_version(&self, version: &str) -> Result<()>;
}

/// SQLite-based partition storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database file at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database. Contents vanish with the value.
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

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named partitions; rowid order is creation order
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request identity
CREATE TABLE IF NOT EXISTS entries (
    partition_name TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition_name, method, url)
);

CREATE INDEX IF NOT EXISTS idx_entries_request ON entries(method, url);

-- Lifecycle bookkeeping (active version)
CREATE TABLE IF NOT EXISTS lifecycle (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ACTIVE_VERSION_KEY: &str = "active_version";

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

    Ok(())
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition_name = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;

    Ok(count as usize)
  }

  fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        "SELECT partition_name, status, headers, body, digest, cached_at FROM entries
         WHERE partition_name = ? AND method = ? AND url = ?",
        params![partition, key.method(), key.url()],
        StoredRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, partition, e))?;

    Ok(row.and_then(|row| row.into_cached(key)))
  }

  fn get_any(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT e.partition_name, e.status, e.headers, e.body, e.digest, e.cached_at FROM entries e
         INNER JOIN partitions p ON p.name = e.partition_name
         WHERE e.method = ? AND e.url = ?
         ORDER BY p.rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![key.method(), key.url()], StoredRow::from_row)
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?
      .collect::<rusqlite::Result<Vec<StoredRow>>>()
      .map_err(|e| eyre!("Failed to read entry for {}: {}", key, e))?;

    // A corrupted copy in one partition must not hide a good one in another
    Ok(rows.into_iter().find_map(|row| row.into_cached(key)))
  }

  fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()> {
    self.put_many(partition, &[(key.clone(), response.clone())])
  }

  fn put_many(&self, partition: &str, entries: &[(CacheKey, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    for (key, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO entries (partition_name, method, url, status, headers, body, digest, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          partition,
          key.method(),
          key.url(),
          response.status,
          headers,
          &response.body[..],
          body_digest(&response.body)
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, partition, e))?;
    }

    // Dropping the transaction on error rolls back the whole batch
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn active_version(&self) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM lifecycle WHERE name = ?",
        params![ACTIVE_VERSION_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO lifecycle (name, value) VALUES (?, ?)",
        params![ACTIVE_VERSION_KEY, version],
      )
      .map_err(|e| eyre!("Failed to record active version: {}", e))?;

    Ok(())
  }
}

/// Raw entry columns as read from SQLite.
struct StoredRow {
  partition: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  digest: String,
  cached_at: String,
}

impl StoredRow {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      partition: row.get(0)?,
      status: row.get(1)?,
      headers: row.get(2)?,
      body: row.get(3)?,
      digest: row.get(4)?,
      cached_at: row.get(5)?,
    })
  }

  /// Decode into a cached response. Entries that fail to decode, or whose
  /// body no longer matches the stored digest, are reported and read back
  /// as a miss.
  fn into_cached(self, key: &CacheKey) -> Option<CachedResponse> {
    match self.decode(key) {
      Ok(cached) => Some(cached),
      Err(e) => {
        warn!(partition = %self.partition, key = %key, error = %e, "Ignoring corrupted cache entry");
        None
      }
    }
  }

  fn decode(&self, key: &CacheKey) -> Result<CachedResponse> {
    if body_digest(&self.body) != self.digest {
      return Err(eyre!("Body of {} does not match its digest", key));
    }

    let headers: Vec<(String, String)> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
    let cached_at = parse_datetime(&self.cached_at)?;

    Ok(CachedResponse {
      response: Response::new(self.status, headers, self.body.clone())
        .with_source(ResponseSource::Cache),
      partition: self.partition.clone(),
      cached_at,
    })
  }
}

fn body_digest(body: &[u8]) -> String {
  hex::encode(Sha256::digest(body))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> CacheKey {
    let url = Url::parse("http://localhost:3000").unwrap().join(path).unwrap();
    CacheKey::new("GET", &url)
  }

  fn html(body: &str) -> Response {
    Response::new(
      200,
      vec![("content-type".to_string(), "text/html".to_string())],
      body.to_string(),
    )
  }

  #[test]
  fn test_put_then_get_round_trips() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = html("<h1>Collection</h1>");

    storage.put("pages-v1", &key("/collection"), &response).unwrap();
    let cached = storage.get("pages-v1", &key("/collection")).unwrap().unwrap();

    assert_eq!(cached.partition, "pages-v1");
    assert_eq!(cached.response.status, 200);
    assert_eq!(cached.response.headers, response.headers);
    assert_eq!(cached.response.body, response.body);
    assert_eq!(cached.response.source, ResponseSource::Cache);
  }

  #[test]
  fn test_get_misses_other_partitions_and_methods() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("pages-v1", &key("/about"), &html("about")).unwrap();

    assert!(storage.get("images-v1", &key("/about")).unwrap().is_none());

    let url = Url::parse("http://localhost:3000/about").unwrap();
    let head = CacheKey::new("HEAD", &url);
    assert!(storage.get("pages-v1", &head).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("pages-v1", &key("/"), &html("old")).unwrap();
    storage.put("pages-v1", &key("/"), &html("new")).unwrap();

    let cached = storage.get("pages-v1", &key("/")).unwrap().unwrap();
    assert_eq!(cached.response.text(), "new");
    assert_eq!(storage.entry_count("pages-v1").unwrap(), 1);
  }

  #[test]
  fn test_delete_partition_drops_its_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("static-v0", &key("/app.js"), &html("js")).unwrap();
    storage.put("pages-v1", &key("/"), &html("home")).unwrap();

    assert!(storage.delete_partition("static-v0").unwrap());
    assert!(!storage.delete_partition("static-v0").unwrap());

    assert_eq!(storage.partition_names().unwrap(), vec!["pages-v1"]);
    assert_eq!(storage.entry_count("static-v0").unwrap(), 0);
    assert!(storage.get_any(&key("/app.js")).unwrap().is_none());
  }

  #[test]
  fn test_partition_names_keep_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_partition("static-v1").unwrap();
    storage.open_partition("pages-v1").unwrap();
    storage.open_partition("static-v1").unwrap();

    assert_eq!(
      storage.partition_names().unwrap(),
      vec!["static-v1", "pages-v1"]
    );
  }

  #[test]
  fn test_get_any_prefers_oldest_partition() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_partition("pages-v1").unwrap();
    storage.open_partition("static-v1").unwrap();
    storage.put("static-v1", &key("/"), &html("from static")).unwrap();
    storage.put("pages-v1", &key("/"), &html("from pages")).unwrap();

    let cached = storage.get_any(&key("/")).unwrap().unwrap();
    assert_eq!(cached.partition, "pages-v1");
    assert_eq!(cached.response.text(), "from pages");
  }

  #[test]
  fn test_corrupted_entry_reads_as_miss() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("pages-v1", &key("/"), &html("home")).unwrap();
    storage.put("static-v1", &key("/"), &html("home copy")).unwrap();

    storage
      .conn()
      .unwrap()
      .execute(
        "UPDATE entries SET body = X'00' WHERE partition_name = 'pages-v1'",
        [],
      )
      .unwrap();

    assert!(storage.get("pages-v1", &key("/")).unwrap().is_none());
    let fallback = storage.get_any(&key("/")).unwrap().unwrap();
    assert_eq!(fallback.partition, "static-v1");
  }

  #[test]
  fn test_undecodable_entry_does_not_hide_other_copies() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("pages-v1", &key("/"), &html("home")).unwrap();
    storage.put("static-v1", &key("/"), &html("home copy")).unwrap();
    storage.put("images-v1", &key("/"), &html("home image")).unwrap();

    {
      let conn = storage.conn().unwrap();
      conn
        .execute(
          "UPDATE entries SET headers = 'garbage' WHERE partition_name = 'pages-v1'",
          [],
        )
        .unwrap();
      conn
        .execute(
          "UPDATE entries SET cached_at = 'yesterday' WHERE partition_name = 'static-v1'",
          [],
        )
        .unwrap();
    }

    assert!(storage.get("pages-v1", &key("/")).unwrap().is_none());
    assert!(storage.get("static-v1", &key("/")).unwrap().is_none());
    let fallback = storage.get_any(&key("/")).unwrap().unwrap();
    assert_eq!(fallback.partition, "images-v1");
    assert_eq!(fallback.response.text(), "home image");
  }

  #[test]
  fn test_put_many_is_all_or_nothing() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .conn()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_privacy BEFORE INSERT ON entries
         WHEN NEW.url LIKE '%/privacy'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
      )
      .unwrap();

    let batch = vec![
      (key("/"), html("home")),
      (key("/about"), html("about")),
      (key("/privacy"), html("privacy")),
    ];
    assert!(storage.put_many("pages-v1", &batch).is_err());
    assert_eq!(storage.entry_count("pages-v1").unwrap(), 0);
    assert!(storage.get_any(&key("/")).unwrap().is_none());

    storage.put_many("pages-v1", &batch[..2]).unwrap();
    assert_eq!(storage.entry_count("pages-v1").unwrap(), 2);
  }

  #[test]
  fn test_active_version_is_recorded() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.active_version().unwrap(), None);

    storage.set_active_version("v1").unwrap();
    storage.set_active_version("v2").unwrap();
    assert_eq!(storage.active_version().unwrap().as_deref(), Some("v2"));
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("images-v1", &key("/hero.png"), &html("png")).unwrap();
      storage.set_active_version("v1").unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let cached = storage.get("images-v1", &key("/hero.png")).unwrap().unwrap();
    assert_eq!(cached.response.text(), "png");
    assert_eq!(storage.active_version().unwrap().as_deref(), Some("v1"));
  }
}
