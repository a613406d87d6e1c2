//! Explicit login session passed into every component.

use crate::config::Config;
use crate::remote::Filter;
use crate::resource::{row_str, ResourceKind, Row};

/// Identity and workspace scope of the signed-in user.
///
/// Built once after login and handed to components by reference; dropped on logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub user_id: String,
  pub workspace_id: String,
  pub access_token: Option<String>,
}

impl Session {
  pub fn new(user_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      workspace_id: workspace_id.into(),
      access_token: None,
    }
  }

  pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
    self.access_token = Some(token.into());
    self
  }

  pub fn from_config(config: &Config) -> Self {
    Self {
      user_id: config.session.user_id.clone(),
      workspace_id: config.session.workspace_id.clone(),
      access_token: Config::get_access_token(),
    }
  }

  /// Equality filter scoping a query or channel to this workspace.
  pub fn workspace_filter(&self) -> Filter {
    Filter::eq("workspace_id", &self.workspace_id)
  }

  /// Whether the signed-in user may change `row` directly: they created it,
  /// or the collection has no author.
  pub fn is_author(&self, kind: ResourceKind, row: &Row) -> bool {
    match kind.author_column() {
      Some(column) => row_str(row, column) == Some(self.user_id.as_str()),
      None => true,
    }
  }
}
