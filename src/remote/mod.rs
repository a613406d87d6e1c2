//! Remote row store: row-oriented CRUD against named collections.
//!
//! The backend scopes every row by `workspace_id` and an author column and
//! enforces authorship itself; this client only classifies its failures.

mod rest;

pub use rest::RestClient;

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::{ResourceKind, Row};

/// Failure of a remote call, classified by how callers should react.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// Network, timeout or server-side outage; reads fall back to cache
  #[error("remote unavailable: {0}")]
  Transient(String),
  /// Caller is not allowed to perform the operation
  #[error("not authorized: {0}")]
  Unauthorized(String),
  #[error("not found: {0}")]
  NotFound(String),
  /// Request understood but refused (validation, constraint)
  #[error("rejected by server ({status}): {message}")]
  Rejected { status: u16, message: String },
  #[error("unexpected response: {0}")]
  Decode(String),
}

impl RemoteError {
  pub fn is_transient(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }

  /// Classify a non-success HTTP status.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      401 | 403 => RemoteError::Unauthorized(message),
      404 => RemoteError::NotFound(message),
      408 | 429 | 500..=599 => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
      _ => RemoteError::Rejected { status, message },
    }
  }
}

/// Equality predicate on a column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Filter {
  pub column: String,
  pub value: String,
}

impl Filter {
  pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      column: column.into(),
      value: value.into(),
    }
  }

  /// `column=eq.value`, the form used by both query strings and channel filters.
  pub fn to_expression(&self) -> String {
    format!("{}=eq.{}", self.column, self.value)
  }

  /// Whether `row` satisfies this predicate.
  pub fn matches(&self, row: &Row) -> bool {
    match row.get(&self.column) {
      Some(serde_json::Value::String(s)) => *s == self.value,
      Some(serde_json::Value::Null) | None => false,
      Some(other) => other.to_string() == self.value,
    }
  }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Rows of `kind` matching every filter.
  async fn select(&self, kind: ResourceKind, filters: &[Filter]) -> Result<Vec<Row>, RemoteError>;

  async fn insert(&self, kind: ResourceKind, row: Row) -> Result<Row, RemoteError>;

  /// Apply `patch` to the row `id`, returning the updated row.
  async fn update(&self, kind: ResourceKind, id: &str, patch: Row) -> Result<Row, RemoteError>;

  async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), RemoteError>;

  async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<Row>, RemoteError> {
    let mut rows = self.select(kind, &[Filter::eq("id", id)]).await?;
    Ok(if rows.is_empty() {
      None
    } else {
      Some(rows.swap_remove(0))
    })
  }
}
