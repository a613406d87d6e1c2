//! In-memory collection kept current by change-feed deltas.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{trace, warn};

use super::ChangeHandler;
use crate::resource::{reserialize, row_str, Resource, Row};

/// Shared, ordered view of one collection (newest inserts first).
///
/// Writes carrying an older `updated_at` than the held copy are discarded, so
/// a slow revalidation cannot roll back a newer delta or vice versa.
pub struct LiveCollection<T> {
  items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for LiveCollection<T> {
  fn clone(&self) -> Self {
    Self {
      items: Arc::clone(&self.items),
    }
  }
}

impl<T: Resource> Default for LiveCollection<T> {
  fn default() -> Self {
    Self::new(Vec::new())
  }
}

impl<T: Resource> LiveCollection<T> {
  pub fn new(items: Vec<T>) -> Self {
    Self {
      items: Arc::new(Mutex::new(items)),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Vec<T>> {
    self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn snapshot(&self) -> Vec<T> {
    self.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn get(&self, id: &str) -> Option<T> {
    self.lock().iter().find(|item| item.id() == id).cloned()
  }

  /// Insert or replace `record`. Returns false if the held copy is newer.
  pub fn upsert(&self, record: T) -> bool {
    let mut items = self.lock();
    match items.iter_mut().find(|item| item.id() == record.id()) {
      Some(held) => {
        if is_older(&record, held) {
          trace!(id = record.id(), "discarding out-of-date write");
          return false;
        }
        *held = record;
      }
      None => items.insert(0, record),
    }
    true
  }

  pub fn remove(&self, id: &str) -> Option<T> {
    let mut items = self.lock();
    let index = items.iter().position(|item| item.id() == id)?;
    Some(items.remove(index))
  }

  /// Replace the whole collection with a full reload.
  ///
  /// Records missing from `fresh` are dropped; for records present in both,
  /// the newer version wins.
  pub fn replace_all(&self, fresh: Vec<T>) {
    let mut items = self.lock();
    let merged = fresh
      .into_iter()
      .map(|record| match items.iter().find(|held| held.id() == record.id()) {
        Some(held) if is_older(&record, held) => held.clone(),
        _ => record,
      })
      .collect();
    *items = merged;
  }

  fn decode(&self, row: Row) -> Option<T> {
    match reserialize::<T>(&row) {
      Ok(record) => Some(record),
      Err(e) => {
        warn!(kind = %T::kind(), error = %e, "ignoring undecodable change");
        None
      }
    }
  }
}

fn is_older<T: Resource>(incoming: &T, held: &T) -> bool {
  match (incoming.updated_at(), held.updated_at()) {
    (Some(incoming), Some(held)) => incoming < held,
    _ => false,
  }
}

impl<T: Resource> ChangeHandler for LiveCollection<T> {
  fn on_insert(&mut self, row: Row) {
    if let Some(record) = self.decode(row) {
      self.upsert(record);
    }
  }

  /// An update for a record not held locally is treated as an insert.
  fn on_update(&mut self, row: Row) {
    if let Some(record) = self.decode(row) {
      self.upsert(record);
    }
  }

  fn on_delete(&mut self, row: Row) {
    match row_str(&row, "id") {
      Some(id) => {
        self.remove(id);
      }
      None => warn!(kind = %T::kind(), "delete event without id"),
    }
  }

  fn on_resync(&mut self, rows: Vec<Row>) {
    let fresh = rows.into_iter().filter_map(|row| self.decode(row)).collect();
    self.replace_all(fresh);
  }
}
