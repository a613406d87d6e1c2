//! Ledger of mutations attempted while offline, replayed on reconnect.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::db::{Database, StoreError};
use crate::resource::{ResourceKind, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOp {
  Create,
  Update,
  Delete,
}

impl QueueOp {
  fn as_str(self) -> &'static str {
    match self {
      QueueOp::Create => "create",
      QueueOp::Update => "update",
      QueueOp::Delete => "delete",
    }
  }
}

impl fmt::Display for QueueOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for QueueOp {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(QueueOp::Create),
      "update" => Ok(QueueOp::Update),
      "delete" => Ok(QueueOp::Delete),
      other => Err(StoreError::Corrupt(format!("unknown queued operation {}", other))),
    }
  }
}

/// A write recorded while the remote store was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMutation {
  /// Monotonic, assigned by the ledger
  pub id: i64,
  pub resource_kind: ResourceKind,
  pub resource_id: String,
  pub operation: QueueOp,
  pub payload: Row,
  pub enqueued_at: DateTime<Utc>,
  pub synced: bool,
  /// Set once the server refused the mutation for good; it is no longer replayed
  pub failure: Option<String>,
}

/// Process-local ledger backed by the `sync_queue` table.
#[derive(Clone)]
pub struct SyncQueue {
  db: Database,
}

impl SyncQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Record a mutation; returns its id.
  pub fn enqueue(
    &self,
    kind: ResourceKind,
    resource_id: &str,
    operation: QueueOp,
    payload: &Row,
  ) -> Result<i64, StoreError> {
    let data = serde_json::to_vec(payload)?;
    let conn = self.db.conn()?;
    conn.execute(
      "INSERT INTO sync_queue (resource_kind, resource_id, operation, payload, enqueued_at, synced)
       VALUES (?, ?, ?, ?, ?, 0)",
      params![
        kind.table(),
        resource_id,
        operation.as_str(),
        data,
        Utc::now().timestamp_millis()
      ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, kind = %kind, resource_id, %operation, "queued offline mutation");
    Ok(id)
  }

  /// Unsynced mutations still to be replayed, in the order they were queued.
  pub fn pending(&self) -> Result<Vec<QueuedMutation>, StoreError> {
    self.query("WHERE synced = 0 AND failed_at IS NULL")
  }

  /// Mutations set aside after a permanent failure.
  pub fn failed(&self) -> Result<Vec<QueuedMutation>, StoreError> {
    self.query("WHERE synced = 0 AND failed_at IS NOT NULL")
  }

  /// Whether a mutation of this record is still waiting to be replayed.
  pub fn has_pending(&self, kind: ResourceKind, resource_id: &str) -> Result<bool, StoreError> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM sync_queue
       WHERE resource_kind = ? AND resource_id = ? AND synced = 0 AND failed_at IS NULL",
      params![kind.table(), resource_id],
      |row| row.get(0),
    )?;
    Ok(count > 0)
  }

  /// Every mutation ever queued, synced or not.
  pub fn all(&self) -> Result<Vec<QueuedMutation>, StoreError> {
    self.query("")
  }

  pub fn mark_synced(&self, id: i64) -> Result<(), StoreError> {
    let conn = self.db.conn()?;
    let changed = conn.execute("UPDATE sync_queue SET synced = 1 WHERE id = ?", params![id])?;
    if changed == 0 {
      return Err(StoreError::Corrupt(format!("no queued mutation with id {}", id)));
    }
    Ok(())
  }

  /// Set a mutation aside so replay skips it.
  pub fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
    let conn = self.db.conn()?;
    let changed = conn.execute(
      "UPDATE sync_queue SET failed_at = ?, last_error = ? WHERE id = ? AND synced = 0",
      params![Utc::now().timestamp_millis(), error, id],
    )?;
    if changed == 0 {
      return Err(StoreError::Corrupt(format!("no unsynced mutation with id {}", id)));
    }
    Ok(())
  }

  /// Put a failed mutation back in line for the next replay.
  pub fn retry(&self, id: i64) -> Result<(), StoreError> {
    let conn = self.db.conn()?;
    let changed = conn.execute(
      "UPDATE sync_queue SET failed_at = NULL, last_error = NULL
       WHERE id = ? AND synced = 0 AND failed_at IS NOT NULL",
      params![id],
    )?;
    if changed == 0 {
      return Err(StoreError::Corrupt(format!("no failed mutation with id {}", id)));
    }
    Ok(())
  }

  pub fn clear(&self) -> Result<(), StoreError> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM sync_queue", [])?;
    Ok(())
  }

  fn query(&self, clause: &str) -> Result<Vec<QueuedMutation>, StoreError> {
    let conn = self.db.conn()?;
    let sql = format!(
      "SELECT id, resource_kind, resource_id, operation, payload, enqueued_at, synced, last_error
       FROM sync_queue {} ORDER BY id",
      clause
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Vec<u8>>(4)?,
          row.get::<_, i64>(5)?,
          row.get::<_, bool>(6)?,
          row.get::<_, Option<String>>(7)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(id, kind, resource_id, operation, payload, enqueued_at, synced, failure)| {
        Ok(QueuedMutation {
          id,
          resource_kind: kind.parse().map_err(StoreError::Corrupt)?,
          resource_id,
          operation: operation.parse()?,
          payload: serde_json::from_slice(&payload)?,
          enqueued_at: Utc
            .timestamp_millis_opt(enqueued_at)
            .single()
            .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp {}", enqueued_at)))?,
          synced,
          failure,
        })
      })
      .collect()
  }
}
