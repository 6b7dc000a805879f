//! Cache generation storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedResponse, RequestKey};

/// A cached response together with when it was stored.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub url: String,
  pub response: CachedResponse,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Storage is organised in named caches (generations). Exactly one of them
/// is marked active; lookups and write-through go to the active one.
pub trait CacheStorage: Send + Sync {
  /// Names of every existing cache, oldest first.
  fn cache_names(&self) -> Result<Vec<String>>;

  fn has_cache(&self, name: &str) -> Result<bool>;

  /// Delete a cache and all of its entries. Returns `false` if it did not exist.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Store one response, creating the cache if needed.
  fn put(&self, cache: &str, key: &RequestKey, response: &CachedResponse) -> Result<()>;

  /// Create (or replace) a cache with exactly these entries, atomically.
  fn populate(&self, cache: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()>;

  /// Find a response; with `ignore_search` the query string is not compared.
  fn lookup(&self, cache: &str, key: &RequestKey, ignore_search: bool)
    -> Result<Option<CachedEntry>>;

  /// Delete every entry of `cache` whose URL satisfies `matches`.
  fn remove_where(&self, cache: &str, matches: &dyn Fn(&str) -> bool) -> Result<usize>;

  fn active_cache(&self) -> Result<Option<String>>;

  fn set_active_cache(&self, name: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    url_without_search TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_search
    ON cache_entries(cache_name, method, url_without_search);

CREATE TABLE IF NOT EXISTS gateway_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ACTIVE_KEY: &str = "active_cache";

fn ensure_cache(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?1, ?2)",
      params![name, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  cache: &str,
  key: &RequestKey,
  response: &CachedResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, key_hash, method, url, url_without_search, status, headers, body, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
      params![
        cache,
        key.hash(),
        key.method,
        key.url,
        key.url_without_search,
        response.status,
        headers,
        response.body,
        Utc::now().to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url, cache, e))?;
  Ok(())
}

impl CacheStorage for SqliteCacheStorage {
  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM cache_generations WHERE name = ?1)",
        [name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?1", [name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_generations WHERE name = ?1", [name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn put(&self, cache: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_cache(&tx, cache)?;
    insert_entry(&tx, cache, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn populate(&self, cache: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?1", [cache])
      .map_err(|e| eyre!("Failed to reset cache {}: {}", cache, e))?;
    ensure_cache(&tx, cache)?;
    for (key, response) in entries {
      insert_entry(&tx, cache, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn lookup(
    &self,
    cache: &str,
    key: &RequestKey,
    ignore_search: bool,
  ) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    type Row = (String, u16, String, Vec<u8>, String);
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Row> {
      Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    };

    let found: Option<Row> = if ignore_search {
      conn
        .query_row(
          "SELECT url, status, headers, body, cached_at FROM cache_entries
           WHERE cache_name = ?1 AND method = ?2 AND url_without_search = ?3
           ORDER BY cached_at DESC LIMIT 1",
          params![cache, key.method, key.url_without_search],
          map_row,
        )
        .optional()
    } else {
      conn
        .query_row(
          "SELECT url, status, headers, body, cached_at FROM cache_entries
           WHERE cache_name = ?1 AND key_hash = ?2",
          params![cache, key.hash()],
          map_row,
        )
        .optional()
    }
    .map_err(|e| eyre!("Failed to look up {} in {}: {}", key.url, cache, e))?;

    let Some((url, status, headers, body, cached_at)) = found else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
    let cached_at = DateTime::parse_from_rfc3339(&cached_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse datetime '{}': {}", cached_at, e))?;

    Ok(Some(CachedEntry {
      url,
      response: CachedResponse {
        status,
        headers,
        body,
      },
      cached_at,
    }))
  }

  fn remove_where(&self, cache: &str, matches: &dyn Fn(&str) -> bool) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let doomed = {
      let mut stmt = tx
        .prepare("SELECT key_hash, url FROM cache_entries WHERE cache_name = ?1")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let rows = stmt
        .query_map([cache], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| eyre!("Failed to list entries of {}: {}", cache, e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;
      rows
        .into_iter()
        .filter(|(_, url)| matches(url))
        .map(|(hash, _)| hash)
        .collect::<Vec<_>>()
    };

    for hash in &doomed {
      tx.execute(
        "DELETE FROM cache_entries WHERE cache_name = ?1 AND key_hash = ?2",
        params![cache, hash],
      )
      .map_err(|e| eyre!("Failed to delete entry from {}: {}", cache, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(doomed.len())
  }

  fn active_cache(&self) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM gateway_meta WHERE key = ?1",
        [ACTIVE_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active cache: {}", e))
  }

  fn set_active_cache(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO gateway_meta (key, value) VALUES (?1, ?2)",
        params![ACTIVE_KEY, name],
      )
      .map_err(|e| eyre!("Failed to set active cache: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(u: &str) -> RequestKey {
    RequestKey::new("GET", &Url::parse(u).unwrap())
  }

  #[test]
  fn test_lookup_exact_and_ignoring_search() {
    let s = SqliteCacheStorage::open_in_memory().unwrap();
    let body = CachedResponse::new(200, "<html>menu</html>").with_header("content-type", "text/html");
    s.put("geopoint-v7", &key("https://app.test/menu.html"), &body)
      .unwrap();

    let with_query = key("https://app.test/menu.html?uid=123");
    assert!(s.lookup("geopoint-v7", &with_query, false).unwrap().is_none());

    let hit = s.lookup("geopoint-v7", &with_query, true).unwrap().unwrap();
    assert_eq!(hit.response, body);
    assert_eq!(hit.url, "https://app.test/menu.html");

    // other generations are separate
    assert!(s.lookup("geopoint-v8", &with_query, true).unwrap().is_none());
  }

  #[test]
  fn test_delete_cache_removes_entries() {
    let s = SqliteCacheStorage::open_in_memory().unwrap();
    s.put("a", &key("https://app.test/x.js"), &CachedResponse::new(200, "x"))
      .unwrap();
    s.put("b", &key("https://app.test/x.js"), &CachedResponse::new(200, "y"))
      .unwrap();
    assert_eq!(s.cache_names().unwrap().len(), 2);

    assert!(s.delete_cache("a").unwrap());
    assert!(!s.delete_cache("a").unwrap());
    assert_eq!(s.cache_names().unwrap(), vec!["b".to_string()]);
    assert!(s.lookup("a", &key("https://app.test/x.js"), false).unwrap().is_none());
  }

  #[test]
  fn test_populate_replaces_contents() {
    let s = SqliteCacheStorage::open_in_memory().unwrap();
    s.put("v1", &key("https://app.test/old.js"), &CachedResponse::new(200, "old"))
      .unwrap();
    s.populate(
      "v1",
      &[(key("https://app.test/new.js"), CachedResponse::new(200, "new"))],
    )
    .unwrap();

    assert!(s.lookup("v1", &key("https://app.test/old.js"), false).unwrap().is_none());
    assert!(s.lookup("v1", &key("https://app.test/new.js"), false).unwrap().is_some());
  }

  #[test]
  fn test_active_cache_roundtrip() {
    let s = SqliteCacheStorage::open_in_memory().unwrap();
    assert_eq!(s.active_cache().unwrap(), None);
    s.set_active_cache("geopoint-v8").unwrap();
    assert_eq!(s.active_cache().unwrap().as_deref(), Some("geopoint-v8"));
  }
}
