//! Durable key-value slots backing the local cache, with a SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Trait for durable storage backends.
///
/// Each logical database name maps to one JSON blob.
pub trait PersistentStore: Send + Sync {
  /// Read the blob stored under `name`.
  fn load(&self, name: &str) -> Result<Option<String>>;

  /// Replace the blob stored under `name`.
  fn save(&self, name: &str, data: &str) -> Result<()>;
}

impl<T: PersistentStore + ?Sized> PersistentStore for &T {
  fn load(&self, name: &str) -> Result<Option<String>> {
    (**self).load(name)
  }

  fn save(&self, name: &str, data: &str) -> Result<()> {
    (**self).save(name, data)
  }
}

impl<T: PersistentStore + ?Sized> PersistentStore for std::sync::Arc<T> {
  fn load(&self, name: &str) -> Result<Option<String>> {
    (**self).load(name)
  }

  fn save(&self, name: &str, data: &str) -> Result<()> {
    (**self).save(name, data)
  }
}

/// Store that keeps blobs in memory only. Used by tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
  slots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl PersistentStore for MemoryStore {
  fn load(&self, name: &str) -> Result<Option<String>> {
    let slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(slots.get(name).cloned())
  }

  fn save(&self, name: &str, data: &str) -> Result<()> {
    let mut slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    slots.insert(name.to_string(), data.to_string());
    Ok(())
  }
}

/// SQLite-based store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location when `None`.
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

  /// Open a store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("trambar-sync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    name TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl PersistentStore for SqliteStore {
  fn load(&self, name: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM kv_store WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from cache database: {}", name, e))
  }

  fn save(&self, name: &str, data: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (name, data, saved_at) VALUES (?, ?, datetime('now'))",
        params![name, data],
      )
      .map_err(|e| eyre!("Failed to write {} to cache database: {}", name, e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sqlite_store_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.load("trambar").unwrap(), None);

    store.save("trambar", r#"{"settings":[]}"#).unwrap();
    assert_eq!(
      store.load("trambar").unwrap().as_deref(),
      Some(r#"{"settings":[]}"#)
    );

    store.save("trambar", "{}").unwrap();
    assert_eq!(store.load("trambar").unwrap().as_deref(), Some("{}"));
    assert_eq!(store.load("other").unwrap(), None);
  }

  #[test]
  fn test_memory_store_round_trip() {
    let store = MemoryStore::new();
    store.save("a", "1").unwrap();
    assert_eq!(store.load("a").unwrap().as_deref(), Some("1"));
    assert_eq!(store.load("b").unwrap(), None);
  }
}
