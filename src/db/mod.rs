pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Failure of a local store operation.
///
/// Local storage is best effort: callers on the read path treat any of these as a miss.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("local store unavailable: {0}")]
  Unavailable(String),
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to encode or decode stored value: {0}")]
  Serde(#[from] serde_json::Error),
  #[error("corrupt row: {0}")]
  Corrupt(String),
}

/// Shared handle to the local SQLite database holding the cache and sync queue.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    // WAL keeps readers unblocked while a writer commits
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

    Self::from_connection(conn)
  }

  /// In-memory database, used when no durable location is wanted
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("plansync").join("plansync.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn().map_err(|e| eyre!("{}", e))?;

    let current: i64 = conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    for (version, migration) in schema::MIGRATIONS.iter().enumerate().skip(current as usize) {
      conn
        .execute_batch(migration)
        .map_err(|e| eyre!("Failed to run migration {}: {}", version + 1, e))?;
      conn
        .pragma_update(None, "user_version", version as i64 + 1)
        .map_err(|e| eyre!("Failed to record schema version: {}", e))?;
    }

    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> std::result::Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
  }

  pub fn schema_version(&self) -> std::result::Result<i64, StoreError> {
    let conn = self.conn()?;
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
  }
}
