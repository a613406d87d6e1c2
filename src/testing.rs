//! In-memory stand-ins for the remote backend and the clock.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::approval::{ApprovalBackend, EditOperation, EditRequest, EditStatus, PendingEdit};
use crate::cache::Clock;
use crate::realtime::{ChannelSpec, FeedChannel, FeedMessage, FeedTransport};
use crate::remote::{Filter, RemoteError, RemoteStore};
use crate::resource::{reserialize, row_str, ResourceKind, Row};

/// Clock that only moves when told to.
pub struct ManualClock {
  millis: AtomicI64,
}

impl ManualClock {
  pub fn at_millis(millis: i64) -> Self {
    Self {
      millis: AtomicI64::new(millis),
    }
  }

  pub fn set_millis(&self, millis: i64) {
    self.millis.store(millis, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
      .single()
      .unwrap()
  }
}

#[derive(Default)]
struct State {
  tables: HashMap<ResourceKind, Vec<Row>>,
  channels: Vec<(ChannelSpec, mpsc::UnboundedSender<FeedMessage>)>,
  offline: bool,
  fail_next: Option<RemoteError>,
  fail_later: Option<(usize, RemoteError)>,
  failing_opens: usize,
  opens: usize,
  edits_created: i64,
}

impl State {
  fn rows(&mut self, kind: ResourceKind) -> &mut Vec<Row> {
    self.tables.entry(kind).or_default()
  }

  fn position(&self, kind: ResourceKind, id: &str) -> Option<usize> {
    self
      .tables
      .get(&kind)?
      .iter()
      .position(|row| row_str(row, "id") == Some(id))
  }

  /// Deliver to every open channel on `kind` whose filter matches `row`.
  fn emit(&mut self, kind: ResourceKind, row: &Row, message: FeedMessage) {
    self.channels.retain(|(spec, tx)| {
      if spec.kind != kind || !spec.filter.matches(row) {
        return !tx.is_closed();
      }
      tx.send(message.clone()).is_ok()
    });
  }
}

/// Shared in-memory backend: row store, approval procedures and change feed.
///
/// Handles made with [`as_user`](Self::as_user) act as that user and get the
/// same authorship checks the real backend enforces. The handle from
/// [`new`](Self::new) acts as no one and is never refused.
#[derive(Clone, Default)]
pub struct MemoryBackend {
  state: Arc<Mutex<State>>,
  user: Option<String>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn as_user(&self, user: &str) -> Self {
    Self {
      state: Arc::clone(&self.state),
      user: Some(user.to_string()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap()
  }

  /// Store a row without emitting change events.
  pub fn seed(&self, kind: ResourceKind, row: Row) {
    self.lock().rows(kind).push(row);
  }

  pub fn rows(&self, kind: ResourceKind) -> Vec<Row> {
    self.lock().tables.get(&kind).cloned().unwrap_or_default()
  }

  pub fn row(&self, kind: ResourceKind, id: &str) -> Option<Row> {
    self
      .rows(kind)
      .into_iter()
      .find(|row| row_str(row, "id") == Some(id))
  }

  pub fn edits(&self) -> Vec<PendingEdit> {
    reserialize(self.rows(ResourceKind::PendingEdits)).unwrap()
  }

  /// Make every store and approval call fail as unreachable.
  pub fn set_offline(&self, offline: bool) {
    self.lock().offline = offline;
  }

  /// Fail the next store or approval call with `error`.
  pub fn fail_next(&self, error: RemoteError) {
    self.lock().fail_next = Some(error);
  }

  /// Let `calls` store or approval calls through, then fail the next one.
  pub fn fail_after(&self, calls: usize, error: RemoteError) {
    self.lock().fail_later = Some((calls, error));
  }

  pub fn feed(&self) -> Arc<dyn FeedTransport> {
    Arc::new(self.clone())
  }

  /// Refuse the next `n` channel opens.
  pub fn fail_opens(&self, n: usize) {
    self.lock().failing_opens = n;
  }

  /// Channel open attempts so far, failed ones included.
  pub fn open_count(&self) -> usize {
    self.lock().opens
  }

  /// Close every open channel as the server would.
  pub fn close_channels(&self) {
    for (_, tx) in self.lock().channels.drain(..) {
      let _ = tx.send(FeedMessage::Closed);
    }
  }

  /// Deliver `message` to every channel on `kind`, ignoring channel filters.
  pub fn push(&self, kind: ResourceKind, message: FeedMessage) {
    self
      .lock()
      .channels
      .retain(|(spec, tx)| spec.kind != kind || tx.send(message.clone()).is_ok());
  }

  fn check(&self, state: &mut State) -> Result<(), RemoteError> {
    if state.offline {
      return Err(RemoteError::Transient("connection refused".to_string()));
    }
    if let Some(error) = state.fail_next.take() {
      return Err(error);
    }
    match state.fail_later.take() {
      Some((0, error)) => Err(error),
      Some((calls, error)) => {
        state.fail_later = Some((calls - 1, error));
        Ok(())
      }
      None => Ok(()),
    }
  }

  fn check_author(&self, kind: ResourceKind, row: &Row) -> Result<(), RemoteError> {
    match (&self.user, kind.author_column()) {
      (Some(user), Some(column)) if row_str(row, column) != Some(user.as_str()) => Err(
        RemoteError::Unauthorized(format!("{} is not the author of this {}", user, kind)),
      ),
      _ => Ok(()),
    }
  }

  /// Load a pending edit the acting user may resolve.
  fn resolvable(&self, state: &State, edit_id: &str) -> Result<(usize, PendingEdit), RemoteError> {
    let index = state
      .position(ResourceKind::PendingEdits, edit_id)
      .ok_or_else(|| RemoteError::NotFound(format!("pending edit {}", edit_id)))?;
    let edit: PendingEdit = reserialize(&state.tables[&ResourceKind::PendingEdits][index])
      .map_err(|e| RemoteError::Decode(e.to_string()))?;

    if let Some(user) = &self.user {
      if *user != edit.approver_id {
        return Err(RemoteError::Unauthorized("only the author can resolve".to_string()));
      }
    }
    if !edit.is_pending() {
      return Err(RemoteError::Rejected {
        status: 409,
        message: format!("edit {} already resolved", edit_id),
      });
    }
    Ok((index, edit))
  }

  fn set_status(&self, state: &mut State, index: usize, status: EditStatus) {
    let row = {
      let rows = state.rows(ResourceKind::PendingEdits);
      rows[index]["status"] = json!(status);
      rows[index].clone()
    };
    state.emit(ResourceKind::PendingEdits, &row, FeedMessage::Update(row.clone()));
  }
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
  filters.iter().all(|filter| filter.matches(row))
}

#[async_trait]
impl RemoteStore for MemoryBackend {
  async fn select(&self, kind: ResourceKind, filters: &[Filter]) -> Result<Vec<Row>, RemoteError> {
    let mut state = self.lock();
    self.check(&mut state)?;
    Ok(
      state
        .rows(kind)
        .iter()
        .filter(|row| matches_all(row, filters))
        .cloned()
        .collect(),
    )
  }

  async fn insert(&self, kind: ResourceKind, row: Row) -> Result<Row, RemoteError> {
    let mut state = self.lock();
    self.check(&mut state)?;
    let id = row_str(&row, "id")
      .ok_or_else(|| RemoteError::Rejected {
        status: 400,
        message: "missing id".to_string(),
      })?
      .to_string();
    if state.position(kind, &id).is_some() {
      return Err(RemoteError::Rejected {
        status: 409,
        message: format!("duplicate id {}", id),
      });
    }

    state.rows(kind).push(row.clone());
    state.emit(kind, &row, FeedMessage::Insert(row.clone()));
    Ok(row)
  }

  async fn update(&self, kind: ResourceKind, id: &str, patch: Row) -> Result<Row, RemoteError> {
    let mut state = self.lock();
    self.check(&mut state)?;
    let index = state
      .position(kind, id)
      .ok_or_else(|| RemoteError::NotFound(format!("{} {}", kind, id)))?;
    self.check_author(kind, &state.rows(kind)[index])?;

    let row = {
      let row = &mut state.rows(kind)[index];
      if let (Some(target), Value::Object(fields)) = (row.as_object_mut(), patch) {
        target.extend(fields);
      }
      row.clone()
    };
    state.emit(kind, &row, FeedMessage::Update(row.clone()));
    Ok(row)
  }

  async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), RemoteError> {
    let mut state = self.lock();
    self.check(&mut state)?;
    let index = state
      .position(kind, id)
      .ok_or_else(|| RemoteError::NotFound(format!("{} {}", kind, id)))?;
    self.check_author(kind, &state.rows(kind)[index])?;

    let row = state.rows(kind).remove(index);
    state.emit(kind, &row, FeedMessage::Delete(row.clone()));
    Ok(())
  }
}

#[async_trait]
impl ApprovalBackend for MemoryBackend {
  async fn request_edit(&self, request: &EditRequest) -> Result<String, RemoteError> {
    let mut state = self.lock();
    self.check(&mut state)?;
    let target = state
      .position(request.resource_kind, &request.resource_id)
      .map(|index| state.tables[&request.resource_kind][index].clone())
      .ok_or_else(|| RemoteError::NotFound(format!("{} {}", request.resource_kind, request.resource_id)))?;
    let approver = request
      .resource_kind
      .author_column()
      .and_then(|column| row_str(&target, column))
      .unwrap_or_default()
      .to_string();

    state.edits_created += 1;
    let edit = PendingEdit {
      id: format!("pe{}", state.edits_created),
      workspace_id: request.workspace_id.clone(),
      requester_id: self.user.clone().unwrap_or_default(),
      approver_id: approver,
      resource_kind: request.resource_kind,
      resource_id: request.resource_id.clone(),
      operation: request.operation,
      original_snapshot: request.original.clone(),
      proposed_snapshot: request.proposed.clone(),
      rationale: request.rationale.clone(),
      status: EditStatus::Pending,
      created_at: Utc
        .timestamp_opt(1_780_000_000 + state.edits_created, 0)
        .single()
        .unwrap(),
    };

    let row = serde_json::to_value(&edit).unwrap();
    state.rows(ResourceKind::PendingEdits).push(row.clone());
    state.emit(ResourceKind::PendingEdits, &row, FeedMessage::Insert(row.clone()));
    Ok(edit.id)
  }

  async fn approve_edit(&self, edit_id: &str) -> Result<(), RemoteError> {
    let mut state = self.lock();
    self.check(&mut state)?;
    let (index, edit) = self.resolvable(&state, edit_id)?;
    let kind = edit.resource_kind;
    let target = state
      .position(kind, &edit.resource_id)
      .ok_or_else(|| RemoteError::NotFound(format!("{} {}", kind, edit.resource_id)))?;

    // Target mutation and status change happen under one lock
    match (edit.operation, edit.proposed_snapshot) {
      (EditOperation::Edit, Some(proposed)) => {
        state.rows(kind)[target] = proposed.clone();
        state.emit(kind, &proposed, FeedMessage::Update(proposed.clone()));
      }
      (EditOperation::Edit, None) => {
        return Err(RemoteError::Rejected {
          status: 400,
          message: "edit without proposed data".to_string(),
        })
      }
      (EditOperation::Delete, _) => {
        let row = state.rows(kind).remove(target);
        state.emit(kind, &row, FeedMessage::Delete(row.clone()));
      }
    }
    self.set_status(&mut state, index, EditStatus::Approved);
    Ok(())
  }

  async fn reject_edit(&self, edit_id: &str) -> Result<(), RemoteError> {
    let mut state = self.lock();
    self.check(&mut state)?;
    let (index, _) = self.resolvable(&state, edit_id)?;
    self.set_status(&mut state, index, EditStatus::Rejected);
    Ok(())
  }

  async fn pending_edits(
    &self,
    workspace_id: &str,
    approver_id: &str,
  ) -> Result<Vec<PendingEdit>, RemoteError> {
    let rows = self
      .select(
        ResourceKind::PendingEdits,
        &[
          Filter::eq("workspace_id", workspace_id),
          Filter::eq("approver_id", approver_id),
          Filter::eq("status", "pending"),
        ],
      )
      .await?;
    let mut edits: Vec<PendingEdit> = reserialize(rows).map_err(|e| RemoteError::Decode(e.to_string()))?;
    edits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(edits)
  }

  async fn pending_edit(&self, edit_id: &str) -> Result<Option<PendingEdit>, RemoteError> {
    match self.get(ResourceKind::PendingEdits, edit_id).await? {
      Some(row) => reserialize(row)
        .map(Some)
        .map_err(|e| RemoteError::Decode(e.to_string())),
      None => Ok(None),
    }
  }
}

#[async_trait]
impl FeedTransport for MemoryBackend {
  async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, RemoteError> {
    let mut state = self.lock();
    state.opens += 1;
    if state.failing_opens > 0 {
      state.failing_opens -= 1;
      return Err(RemoteError::Transient("channel refused".to_string()));
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    state.channels.push((spec.clone(), tx));
    Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
  }
}
