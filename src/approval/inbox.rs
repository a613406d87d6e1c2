use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::PendingEdit;
use crate::realtime::ChangeHandler;
use crate::resource::{reserialize, row_str, Row};

/// Live list of edits awaiting one approver, newest first.
#[derive(Clone)]
pub struct Inbox {
  approver_id: String,
  edits: Arc<Mutex<Vec<PendingEdit>>>,
}

impl Inbox {
  pub fn new(approver_id: &str, edits: Vec<PendingEdit>) -> Self {
    Self {
      edits: Arc::new(Mutex::new(awaiting(approver_id, edits))),
      approver_id: approver_id.to_string(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Vec<PendingEdit>> {
    self.edits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn snapshot(&self) -> Vec<PendingEdit> {
    self.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn apply(&self, row: Row) {
    let Some(edit) = decode(&row) else {
      return;
    };

    let mut edits = self.lock();
    edits.retain(|held| held.id != edit.id);
    if edit.approver_id == self.approver_id && edit.is_pending() {
      debug!(edit_id = %edit.id, "edit awaiting approval");
      let at = edits
        .iter()
        .position(|held| held.created_at < edit.created_at)
        .unwrap_or(edits.len());
      edits.insert(at, edit);
    }
  }
}

fn decode(row: &Row) -> Option<PendingEdit> {
  match reserialize(row) {
    Ok(edit) => Some(edit),
    Err(e) => {
      warn!(error = %e, "ignoring undecodable pending edit");
      None
    }
  }
}

fn awaiting(approver_id: &str, mut edits: Vec<PendingEdit>) -> Vec<PendingEdit> {
  edits.retain(|edit| edit.approver_id == approver_id && edit.is_pending());
  edits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
  edits
}

impl ChangeHandler for Inbox {
  fn on_insert(&mut self, row: Row) {
    self.apply(row);
  }

  fn on_update(&mut self, row: Row) {
    self.apply(row);
  }

  fn on_delete(&mut self, row: Row) {
    if let Some(id) = row_str(&row, "id") {
      self.lock().retain(|held| held.id != id);
    }
  }

  fn on_resync(&mut self, rows: Vec<Row>) {
    let edits = rows.iter().filter_map(decode).collect();
    *self.lock() = awaiting(&self.approver_id, edits);
  }
}
