//! Approval-gated edits: non-authors propose, authors resolve.
//!
//! The backend is the authority on who may resolve what; checks here mirror
//! it so the caller gets a precise error before a round trip.

mod inbox;
mod types;

pub use inbox::Inbox;
pub use types::{ApprovalOutcome, EditOperation, EditRequest, EditStatus, PendingEdit};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::realtime::{Reload, Subscription, SubscriptionManager};
use crate::remote::{RemoteError, RemoteStore};
use crate::resource::{ResourceKind, Row};
use crate::session::Session;

/// Remote procedures of the approval workflow.
#[async_trait]
pub trait ApprovalBackend: Send + Sync {
  /// Record a pending edit; returns its id.
  async fn request_edit(&self, request: &EditRequest) -> Result<String, RemoteError>;

  /// Apply the proposal and mark the edit approved in a single server-side transaction.
  async fn approve_edit(&self, edit_id: &str) -> Result<(), RemoteError>;

  async fn reject_edit(&self, edit_id: &str) -> Result<(), RemoteError>;

  /// Pending edits awaiting `approver_id`, newest first.
  async fn pending_edits(&self, workspace_id: &str, approver_id: &str)
    -> Result<Vec<PendingEdit>, RemoteError>;

  async fn pending_edit(&self, edit_id: &str) -> Result<Option<PendingEdit>, RemoteError>;
}

#[derive(Debug, Error)]
pub enum ApprovalError {
  #[error("only the author of {kind} {id} can resolve edit {edit_id}")]
  NotApprover {
    edit_id: String,
    kind: ResourceKind,
    id: String,
  },
  #[error("edit {0} was already resolved")]
  AlreadyResolved(String),
  #[error("you are the author of {kind} {id}; change it directly")]
  OwnResource { kind: ResourceKind, id: String },
  #[error("{kind} {id} not found")]
  NotFound { kind: ResourceKind, id: String },
  #[error("{op} failed: {source}")]
  Remote {
    op: &'static str,
    #[source]
    source: RemoteError,
  },
}

fn remote(op: &'static str) -> impl FnOnce(RemoteError) -> ApprovalError {
  move |source| ApprovalError::Remote { op, source }
}

/// Shallow merge of `changes` over `base`.
pub fn merge_fields(base: &Row, changes: &Row) -> Row {
  let mut merged = base.clone();
  if let (Some(target), Some(fields)) = (merged.as_object_mut(), changes.as_object()) {
    for (field, value) in fields {
      target.insert(field.clone(), value.clone());
    }
  }
  merged
}

pub struct ApprovalEngine {
  session: Arc<Session>,
  remote: Arc<dyn RemoteStore>,
  backend: Arc<dyn ApprovalBackend>,
}

impl ApprovalEngine {
  pub fn new(
    session: Arc<Session>,
    remote: Arc<dyn RemoteStore>,
    backend: Arc<dyn ApprovalBackend>,
  ) -> Self {
    Self {
      session,
      remote,
      backend,
    }
  }

  /// Propose changing fields of a record authored by someone else.
  pub async fn propose_edit(
    &self,
    kind: ResourceKind,
    id: &str,
    changes: &Row,
    rationale: Option<String>,
  ) -> Result<String, ApprovalError> {
    let current = self.current(kind, id, "request edit").await?;
    self.ensure_not_author(kind, id, &current)?;
    let proposed = merge_fields(&current, changes);
    self
      .request(kind, id, current, EditOperation::Edit, Some(proposed), rationale)
      .await
  }

  /// Propose deleting a record authored by someone else.
  pub async fn propose_delete(
    &self,
    kind: ResourceKind,
    id: &str,
    rationale: Option<String>,
  ) -> Result<String, ApprovalError> {
    let current = self.current(kind, id, "request delete").await?;
    self.ensure_not_author(kind, id, &current)?;
    self
      .request(kind, id, current, EditOperation::Delete, None, rationale)
      .await
  }

  /// File a request against `current`, the record as the caller sees it.
  /// Makes no authorship check of its own.
  pub async fn request(
    &self,
    kind: ResourceKind,
    id: &str,
    current: Row,
    operation: EditOperation,
    proposed: Option<Row>,
    rationale: Option<String>,
  ) -> Result<String, ApprovalError> {
    let request = EditRequest {
      workspace_id: self.session.workspace_id.clone(),
      resource_kind: kind,
      resource_id: id.to_string(),
      operation,
      original: current,
      proposed,
      rationale,
    };
    let edit_id = self
      .backend
      .request_edit(&request)
      .await
      .map_err(remote("request edit"))?;

    info!(edit_id = %edit_id, kind = %kind, id, %operation, "edit requested");
    Ok(edit_id)
  }

  /// Approve a pending edit addressed to the current user.
  ///
  /// If the target changed since the request was filed (or is gone), the
  /// edit is rejected instead and [`ApprovalOutcome::RejectedStale`] returned.
  pub async fn approve(&self, edit_id: &str) -> Result<ApprovalOutcome, ApprovalError> {
    let edit = self.resolvable(edit_id, "approve edit").await?;

    if self.is_stale(&edit).await? {
      self
        .backend
        .reject_edit(edit_id)
        .await
        .map_err(remote("reject stale edit"))?;
      info!(edit_id, kind = %edit.resource_kind, id = %edit.resource_id, "target changed since request, edit rejected");
      return Ok(ApprovalOutcome::RejectedStale);
    }

    self
      .backend
      .approve_edit(edit_id)
      .await
      .map_err(remote("approve edit"))?;
    info!(edit_id, kind = %edit.resource_kind, id = %edit.resource_id, "edit approved");
    Ok(ApprovalOutcome::Approved)
  }

  /// Reject a pending edit; the target record is left untouched.
  pub async fn reject(&self, edit_id: &str) -> Result<ApprovalOutcome, ApprovalError> {
    let edit = self.resolvable(edit_id, "reject edit").await?;
    self
      .backend
      .reject_edit(edit_id)
      .await
      .map_err(remote("reject edit"))?;
    info!(edit_id, kind = %edit.resource_kind, id = %edit.resource_id, "edit rejected");
    Ok(ApprovalOutcome::Rejected)
  }

  /// Pending edits awaiting the current user, newest first.
  pub async fn inbox(&self) -> Result<Vec<PendingEdit>, ApprovalError> {
    let mut edits = self
      .backend
      .pending_edits(&self.session.workspace_id, &self.session.user_id)
      .await
      .map_err(remote("load approvals"))?;
    edits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(edits)
  }

  /// Load the inbox, then keep it current from the change feed.
  ///
  /// Resolved edits drop out as their status changes arrive. Whenever the
  /// channel reopens the list is loaded again in full.
  pub async fn watch_inbox(
    &self,
    manager: &SubscriptionManager,
  ) -> Result<(Inbox, Subscription), ApprovalError> {
    let inbox = Inbox::new(&self.session.user_id, self.inbox().await?);

    let backend = Arc::clone(&self.backend);
    let workspace_id = self.session.workspace_id.clone();
    let approver_id = self.session.user_id.clone();
    let reload: Reload = Arc::new(move || {
      let backend = Arc::clone(&backend);
      let (workspace_id, approver_id) = (workspace_id.clone(), approver_id.clone());
      async move {
        let edits = backend.pending_edits(&workspace_id, &approver_id).await?;
        edits
          .iter()
          .map(|edit| serde_json::to_value(edit).map_err(|e| RemoteError::Decode(e.to_string())))
          .collect::<Result<Vec<Row>, RemoteError>>()
      }
      .boxed()
    });

    let subscription =
      manager.subscribe_with_reload(ResourceKind::PendingEdits, None, inbox.clone(), reload);
    Ok((inbox, subscription))
  }

  fn ensure_not_author(&self, kind: ResourceKind, id: &str, current: &Row) -> Result<(), ApprovalError> {
    if self.session.is_author(kind, current) {
      return Err(ApprovalError::OwnResource {
        kind,
        id: id.to_string(),
      });
    }
    Ok(())
  }

  async fn current(&self, kind: ResourceKind, id: &str, op: &'static str) -> Result<Row, ApprovalError> {
    self
      .remote
      .get(kind, id)
      .await
      .map_err(remote(op))?
      .ok_or_else(|| ApprovalError::NotFound {
        kind,
        id: id.to_string(),
      })
  }

  async fn resolvable(&self, edit_id: &str, op: &'static str) -> Result<PendingEdit, ApprovalError> {
    let edit = self
      .backend
      .pending_edit(edit_id)
      .await
      .map_err(remote(op))?
      .ok_or_else(|| ApprovalError::NotFound {
        kind: ResourceKind::PendingEdits,
        id: edit_id.to_string(),
      })?;

    if edit.approver_id != self.session.user_id {
      return Err(ApprovalError::NotApprover {
        edit_id: edit_id.to_string(),
        kind: edit.resource_kind,
        id: edit.resource_id,
      });
    }
    if !edit.is_pending() {
      return Err(ApprovalError::AlreadyResolved(edit_id.to_string()));
    }
    Ok(edit)
  }

  /// Whether the live record no longer matches what the requester saw.
  async fn is_stale(&self, edit: &PendingEdit) -> Result<bool, ApprovalError> {
    let live = self
      .remote
      .get(edit.resource_kind, &edit.resource_id)
      .await
      .map_err(remote("approve edit"))?;

    let Some(live) = live else {
      debug!(edit_id = %edit.id, "target no longer exists");
      return Ok(true);
    };
    let Some(original) = edit.original_snapshot.as_object() else {
      return Ok(false);
    };

    Ok(
      original
        .iter()
        .any(|(field, value)| live.get(field).unwrap_or(&Value::Null) != value),
    )
  }
}
