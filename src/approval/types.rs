use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::resource::{ResourceKind, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOperation {
  Edit,
  Delete,
}

impl fmt::Display for EditOperation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EditOperation::Edit => f.write_str("edit"),
      EditOperation::Delete => f.write_str("delete"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditStatus {
  Pending,
  Approved,
  Rejected,
}

/// A non-author's proposal to change or delete a record, awaiting the author's decision.
///
/// Field names on the wire follow the `pending_edits` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
  pub id: String,
  pub workspace_id: String,
  pub requester_id: String,
  /// Always the recorded author of the target record
  pub approver_id: String,
  #[serde(rename = "content_type")]
  pub resource_kind: ResourceKind,
  #[serde(rename = "content_id")]
  pub resource_id: String,
  #[serde(rename = "action")]
  pub operation: EditOperation,
  /// The record as the requester saw it
  #[serde(rename = "original_data")]
  pub original_snapshot: Row,
  /// Full after-image for edits, absent for deletes
  #[serde(rename = "new_data", default)]
  pub proposed_snapshot: Option<Row>,
  #[serde(rename = "change_description", default)]
  pub rationale: Option<String>,
  pub status: EditStatus,
  pub created_at: DateTime<Utc>,
}

impl PendingEdit {
  pub fn is_pending(&self) -> bool {
    self.status == EditStatus::Pending
  }
}

/// Arguments of the `request_edit` remote procedure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditRequest {
  #[serde(rename = "p_workspace_id")]
  pub workspace_id: String,
  #[serde(rename = "p_content_type")]
  pub resource_kind: ResourceKind,
  #[serde(rename = "p_content_id")]
  pub resource_id: String,
  #[serde(rename = "p_action")]
  pub operation: EditOperation,
  #[serde(rename = "p_original_data")]
  pub original: Row,
  #[serde(rename = "p_new_data")]
  pub proposed: Option<Row>,
  #[serde(rename = "p_description")]
  pub rationale: Option<String>,
}

/// Result of resolving a pending edit as its approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
  /// Proposed change applied and the edit marked approved
  Approved,
  /// Edit marked rejected, target untouched
  Rejected,
  /// Target changed since the request was made; edit rejected instead of applied
  RejectedStale,
}
