//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::key::FILTER_SEPARATOR;
use super::traits::{CacheEntry, Clock, SystemClock};
use crate::db::{Database, StoreError};

/// Trait for cache storage backends.
///
/// Every operation reports failure as a value; a store that is not ready
/// answers with [`StoreError::Unavailable`].
pub trait CacheStorage: Send + Sync {
  /// Store `value` under `key`, replacing any previous entry.
  fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), StoreError>;

  /// Get the value for `key` if present and not expired.
  ///
  /// An expired entry reads as absent and is deleted in the background.
  fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError>;

  /// Get the raw entry for `key`, expired or not. Never purges.
  fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError>;

  fn delete(&self, key: &str) -> Result<(), StoreError>;

  /// Delete `namespace` itself and every filtered key derived from it. Returns the number removed.
  fn delete_namespace(&self, namespace: &str) -> Result<usize, StoreError>;

  fn clear(&self) -> Result<(), StoreError>;

  /// Current time as seen by this store.
  fn now(&self) -> DateTime<Utc>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
  clock: Arc<dyn Clock>,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self {
      db,
      clock: Arc::new(SystemClock),
    }
  }

  /// Replace the time source used for expiry.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Delete an expired row off the caller's path.
  ///
  /// Only the exact expired row is removed, so a concurrent `put` survives.
  fn purge_later(&self, key: &str, stored_at: DateTime<Utc>) {
    let db = self.db.clone();
    let key = key.to_string();
    let stored_at = stored_at.timestamp_millis();

    let purge = move || {
      let result = db.conn().and_then(|conn| {
        conn
          .execute(
            "DELETE FROM cache WHERE key = ? AND stored_at = ?",
            params![key, stored_at],
          )
          .map_err(StoreError::from)
      });
      match result {
        Ok(_) => debug!(key = %key, "purged expired cache entry"),
        Err(e) => warn!(key = %key, error = %e, "failed to purge expired cache entry"),
      }
    };

    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn_blocking(purge);
      }
      Err(_) => purge(),
    }
  }
}

fn ttl_to_millis(ttl: Duration) -> i64 {
  ttl.as_millis().min(i64::MAX as u128) as i64
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StoreError> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp {}", ms)))
}

impl CacheStorage for SqliteStorage {
  fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), StoreError> {
    let data = serde_json::to_vec(value)?;
    let stored_at = self.clock.now().timestamp_millis();
    let ttl_ms = ttl.map(ttl_to_millis);

    let conn = self.db.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache (key, data, stored_at, ttl_ms) VALUES (?, ?, ?, ?)",
      params![key, data, stored_at, ttl_ms],
    )?;

    Ok(())
  }

  fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
    let entry = match self.get_entry::<T>(key)? {
      Some(entry) => entry,
      None => return Ok(None),
    };

    if entry.is_valid_at(self.clock.now()) {
      Ok(Some(entry.data))
    } else {
      debug!(key = %key, "cache entry expired");
      self.purge_later(key, entry.stored_at);
      Ok(None)
    }
  }

  fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError> {
    let row: Option<(Vec<u8>, i64, Option<i64>)> = {
      let conn = self.db.conn()?;
      conn
        .query_row(
          "SELECT data, stored_at, ttl_ms FROM cache WHERE key = ?",
          params![key],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    };

    match row {
      Some((data, stored_at, ttl_ms)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        data: serde_json::from_slice(&data)?,
        stored_at: millis_to_datetime(stored_at)?,
        ttl: ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
      })),
      None => Ok(None),
    }
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM cache WHERE key = ?", params![key])?;
    Ok(())
  }

  fn delete_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM cache WHERE key = ?1 OR substr(key, 1, length(?1) + 1) = ?1 || ?2",
      params![namespace, FILTER_SEPARATOR.to_string()],
    )?;
    debug!(namespace, removed, "invalidated cache namespace");
    Ok(removed)
  }

  fn clear(&self) -> Result<(), StoreError> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM cache", [])?;
    Ok(())
  }

  fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheKey;
  use crate::remote::Filter;
  use crate::resource::ResourceKind;
  use crate::testing::ManualClock;
  use serde_json::{json, Value};

  fn storage() -> (SqliteStorage, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_millis(0));
    let storage = SqliteStorage::new(Database::open_in_memory().unwrap()).with_clock(clock.clone());
    (storage, clock)
  }

  #[test]
  fn test_put_then_get() {
    let (storage, _) = storage();
    storage.put("k", &vec![1, 2, 3], Some(Duration::from_secs(60))).unwrap();
    assert_eq!(storage.get::<Vec<i32>>("k").unwrap(), Some(vec![1, 2, 3]));
  }

  #[test]
  fn test_notes_ttl_scenario() {
    let (storage, clock) = storage();
    let note_a = json!({"id": "a", "title": "noteA"});
    storage
      .put("notes_ws1", &vec![note_a.clone()], Some(Duration::from_millis(300_000)))
      .unwrap();

    clock.set_millis(299_999);
    assert_eq!(storage.get::<Vec<Value>>("notes_ws1").unwrap(), Some(vec![note_a]));

    clock.set_millis(300_001);
    assert_eq!(storage.get::<Vec<Value>>("notes_ws1").unwrap(), None);
    assert_eq!(storage.get::<Vec<Value>>("notes_ws1").unwrap(), None);
  }

  #[test]
  fn test_expired_read_purges_row() {
    let (storage, clock) = storage();
    storage.put("k", &"v", Some(Duration::from_millis(10))).unwrap();

    clock.set_millis(11);
    assert_eq!(storage.get::<String>("k").unwrap(), None);

    // No runtime here, so the purge ran inline
    assert!(storage.get_entry::<String>("k").unwrap().is_none());
  }

  #[test]
  fn test_get_entry_returns_expired_value() {
    let (storage, clock) = storage();
    storage.put("k", &"old", Some(Duration::from_millis(10))).unwrap();
    clock.set_millis(1_000);

    let entry = storage.get_entry::<String>("k").unwrap().unwrap();
    assert_eq!(entry.data, "old");
    assert!(!entry.is_valid_at(storage.now()));
  }

  #[test]
  fn test_no_ttl_never_expires() {
    let (storage, clock) = storage();
    storage.put("k", &42, None).unwrap();
    clock.set_millis(10 * 365 * 24 * 3600 * 1000);
    assert_eq!(storage.get::<i32>("k").unwrap(), Some(42));
  }

  #[test]
  fn test_put_overwrites_and_resets_age() {
    let (storage, clock) = storage();
    storage.put("k", &1, Some(Duration::from_millis(100))).unwrap();
    clock.set_millis(90);
    storage.put("k", &2, Some(Duration::from_millis(100))).unwrap();
    clock.set_millis(150);
    assert_eq!(storage.get::<i32>("k").unwrap(), Some(2));
  }

  #[test]
  fn test_delete_and_clear() {
    let (storage, _) = storage();
    storage.put("a", &1, None).unwrap();
    storage.put("b", &2, None).unwrap();

    storage.delete("a").unwrap();
    assert_eq!(storage.get::<i32>("a").unwrap(), None);
    assert_eq!(storage.get::<i32>("b").unwrap(), Some(2));

    storage.clear().unwrap();
    assert_eq!(storage.get::<i32>("b").unwrap(), None);
  }

  #[test]
  fn test_delete_namespace_spares_lookalike_keys() {
    let (storage, _) = storage();
    let filtered = CacheKey::filtered(ResourceKind::Notes, "ws1", &[Filter::eq("date", "2026-03-04")]);
    let neighbour = CacheKey::collection(ResourceKind::Notes, "ws1_archive");
    for key in ["notes_ws1", filtered.as_str(), neighbour.as_str(), "notes_ws10", "tasks_ws1"] {
      storage.put(key, &1, None).unwrap();
    }

    assert_eq!(storage.delete_namespace("notes_ws1").unwrap(), 2);
    assert_eq!(storage.get::<i32>(neighbour.as_str()).unwrap(), Some(1));
    assert_eq!(storage.get::<i32>("notes_ws10").unwrap(), Some(1));
    assert_eq!(storage.get::<i32>("tasks_ws1").unwrap(), Some(1));
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    SqliteStorage::new(Database::open(&path).unwrap())
      .put("k", &"durable", None)
      .unwrap();

    let reopened = SqliteStorage::new(Database::open(&path).unwrap());
    assert_eq!(reopened.get::<String>("k").unwrap(), Some("durable".to_string()));
  }

  #[test]
  fn test_type_mismatch_is_an_error_not_a_panic() {
    let (storage, _) = storage();
    storage.put("k", &"text", None).unwrap();
    assert!(matches!(storage.get::<i32>("k"), Err(StoreError::Serde(_))));
  }
}
