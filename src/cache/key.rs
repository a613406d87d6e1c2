//! Namespaced cache keys.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::remote::Filter;
use crate::resource::ResourceKind;

/// Separates a collection key from its filter digest. Never appears in the
/// collection part, so a namespace is matched exactly.
pub const FILTER_SEPARATOR: char = '#';

/// Cache key namespaced by resource kind and workspace, plus any extra filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  /// Whole collection of a workspace, e.g. `notes_ws1`.
  pub fn collection(kind: ResourceKind, workspace_id: &str) -> Self {
    let workspace = workspace_id.replace('%', "%25").replace(FILTER_SEPARATOR, "%23");
    Self(format!("{}_{}", kind.table(), workspace))
  }

  /// Collection narrowed by filters. Filter order does not affect the key.
  pub fn filtered(kind: ResourceKind, workspace_id: &str, filters: &[Filter]) -> Self {
    let mut filters: Vec<&Filter> = filters
      .iter()
      .filter(|f| !(f.column == "workspace_id" && f.value == workspace_id))
      .collect();

    if filters.is_empty() {
      return Self::collection(kind, workspace_id);
    }
    filters.sort();

    let input = filters
      .iter()
      .map(|f| f.to_expression())
      .collect::<Vec<_>>()
      .join("&");

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let collection = Self::collection(kind, workspace_id);
    Self(format!("{}{}{}", collection.0, FILTER_SEPARATOR, &digest[..16]))
  }

  /// Caller-chosen key, used as-is.
  pub fn raw(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_collection_key() {
    assert_eq!(CacheKey::collection(ResourceKind::Notes, "ws1").as_str(), "notes_ws1");
  }

  #[test]
  fn test_workspace_filter_alone_is_the_collection() {
    let key = CacheKey::filtered(
      ResourceKind::Expenses,
      "ws1",
      &[Filter::eq("workspace_id", "ws1")],
    );
    assert_eq!(key.as_str(), "expenses_ws1");
  }

  #[test]
  fn test_filter_order_is_irrelevant() {
    let a = CacheKey::filtered(
      ResourceKind::Tasks,
      "ws1",
      &[Filter::eq("status", "open"), Filter::eq("assigned_to", "bob")],
    );
    let b = CacheKey::filtered(
      ResourceKind::Tasks,
      "ws1",
      &[Filter::eq("assigned_to", "bob"), Filter::eq("status", "open")],
    );
    let other = CacheKey::filtered(ResourceKind::Tasks, "ws1", &[Filter::eq("status", "done")]);

    assert_eq!(a, b);
    assert_ne!(a, other);
    assert!(a.as_str().starts_with("tasks_ws1#"));
  }

  #[test]
  fn test_separator_in_workspace_id_is_escaped() {
    let key = CacheKey::collection(ResourceKind::Notes, "ws#1");
    assert_eq!(key.as_str(), "notes_ws%231");
    assert!(!key.as_str().contains(FILTER_SEPARATOR));
  }
}
