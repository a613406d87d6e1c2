//! Typed records for the collaborative collections of a workspace.
//!
//! Rows travel over the wire as plain JSON objects; these types give each
//! collection a fixed field set. Joins (e.g. author profiles) are not nested
//! here and must be fetched separately.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A raw row as exchanged with the remote store and change feed.
pub type Row = Value;

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

/// Read a string field from a row.
pub fn row_str<'a>(row: &'a Row, field: &str) -> Option<&'a str> {
  row.get(field).and_then(Value::as_str)
}

/// The collections that live inside a workspace.
///
/// Older clients name the kind of a pending edit in the singular
/// (`goal`, `travel_plan`); those names are accepted when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  #[serde(alias = "note")]
  Notes,
  #[serde(alias = "task")]
  Tasks,
  #[serde(alias = "expense")]
  Expenses,
  #[serde(alias = "revenue")]
  Revenues,
  #[serde(alias = "reminder")]
  Reminders,
  #[serde(alias = "goal")]
  Goals,
  #[serde(alias = "quick_note")]
  QuickNotes,
  #[serde(alias = "shopping_item")]
  ShoppingItems,
  #[serde(alias = "travel_plan")]
  TravelPlans,
  #[serde(rename = "movies_watch_list", alias = "movie", alias = "movies")]
  Movies,
  #[serde(alias = "expense_category")]
  ExpenseCategories,
  #[serde(alias = "monthly_budget")]
  MonthlyBudgets,
  #[serde(alias = "pending_edit")]
  PendingEdits,
}

impl ResourceKind {
  pub const ALL: &'static [ResourceKind] = &[
    ResourceKind::Notes,
    ResourceKind::Tasks,
    ResourceKind::Expenses,
    ResourceKind::Revenues,
    ResourceKind::Reminders,
    ResourceKind::Goals,
    ResourceKind::QuickNotes,
    ResourceKind::ShoppingItems,
    ResourceKind::TravelPlans,
    ResourceKind::Movies,
    ResourceKind::ExpenseCategories,
    ResourceKind::MonthlyBudgets,
    ResourceKind::PendingEdits,
  ];

  /// Remote table name.
  pub fn table(self) -> &'static str {
    match self {
      ResourceKind::Notes => "notes",
      ResourceKind::Tasks => "tasks",
      ResourceKind::Expenses => "expenses",
      ResourceKind::Revenues => "revenues",
      ResourceKind::Reminders => "reminders",
      ResourceKind::Goals => "goals",
      ResourceKind::QuickNotes => "quick_notes",
      ResourceKind::ShoppingItems => "shopping_items",
      ResourceKind::TravelPlans => "travel_plans",
      ResourceKind::Movies => "movies_watch_list",
      ResourceKind::ExpenseCategories => "expense_categories",
      ResourceKind::MonthlyBudgets => "monthly_budgets",
      ResourceKind::PendingEdits => "pending_edits",
    }
  }

  /// Column holding the creator of a row; `None` for collections every
  /// member of the workspace edits directly.
  pub fn author_column(self) -> Option<&'static str> {
    match self {
      ResourceKind::PendingEdits => Some("requester_id"),
      ResourceKind::ExpenseCategories => None,
      _ => Some("author_id"),
    }
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.table())
  }
}

impl FromStr for ResourceKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase().replace('-', "_");
    ResourceKind::ALL
      .iter()
      .copied()
      .find(|kind| kind.table() == normalized || kind.table().trim_end_matches('s') == normalized)
      .or_else(|| serde_json::from_value(Value::String(normalized)).ok())
      .ok_or_else(|| format!("unknown resource kind: {}", s))
  }
}

/// Implemented by every typed record of a workspace collection.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  fn kind() -> ResourceKind;

  fn id(&self) -> &str;

  fn workspace_id(&self) -> &str;

  /// `None` for shared collections without an author column.
  fn author_id(&self) -> Option<&str>;

  /// Server-assigned modification time, used as the record version.
  fn updated_at(&self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
  Private,
  #[default]
  Shared,
  Business,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub title: String,
  pub content: Option<String>,
  pub date: Option<NaiveDate>,
  #[serde(default)]
  pub visibility: Visibility,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub title: String,
  pub description: Option<String>,
  pub assigned_to: Option<String>,
  pub due_date: Option<NaiveDate>,
  pub priority: Option<String>,
  pub status: Option<String>,
  pub visibility: Option<Visibility>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseType {
  Fixed,
  Variable,
  OneTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinanceCategory {
  Business,
  Personal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub amount: f64,
  pub category_id: Option<String>,
  pub date: NaiveDate,
  pub description: Option<String>,
  pub expense_type: ExpenseType,
  pub finance_category: FinanceCategory,
  #[serde(default)]
  pub visibility: Visibility,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revenue {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub amount: f64,
  pub source: String,
  pub date: NaiveDate,
  pub description: Option<String>,
  pub is_recurring: Option<bool>,
  #[serde(default)]
  pub visibility: Visibility,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub title: String,
  pub remind_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub is_completed: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub title: String,
  pub description: Option<String>,
  pub target_date: Option<NaiveDate>,
  pub progress: Option<i32>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelPlan {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub destination: String,
  pub start_date: NaiveDate,
  pub end_date: Option<NaiveDate>,
  pub budget: Option<f64>,
  pub notes: Option<String>,
  pub status: Option<String>,
  pub visibility: Option<Visibility>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Entry of the shared movie watch list. The table carries no `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub title: String,
  pub genre: Option<String>,
  pub year: Option<i32>,
  pub rating: Option<f64>,
  pub notes: Option<String>,
  #[serde(default)]
  pub is_watched: Option<bool>,
  pub visibility: Option<Visibility>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseCategory {
  pub id: String,
  pub workspace_id: String,
  pub name: String,
  pub color: Option<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyBudget {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub year: i32,
  pub month: u32,
  pub planned_income: Option<f64>,
  pub planned_expense: Option<f64>,
  pub actual_income: Option<f64>,
  pub actual_expense: Option<f64>,
  pub notes: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickNote {
  pub id: String,
  pub workspace_id: String,
  pub author_id: String,
  pub content: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

macro_rules! impl_resource {
  ($ty:ty, $kind:expr) => {
    impl Resource for $ty {
      fn kind() -> ResourceKind {
        $kind
      }

      fn id(&self) -> &str {
        &self.id
      }

      fn workspace_id(&self) -> &str {
        &self.workspace_id
      }

      fn author_id(&self) -> Option<&str> {
        Some(&self.author_id)
      }

      fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
      }
    }
  };
}

impl_resource!(Note, ResourceKind::Notes);
impl_resource!(Task, ResourceKind::Tasks);
impl_resource!(Expense, ResourceKind::Expenses);
impl_resource!(Revenue, ResourceKind::Revenues);
impl_resource!(Reminder, ResourceKind::Reminders);
impl_resource!(Goal, ResourceKind::Goals);
impl_resource!(QuickNote, ResourceKind::QuickNotes);
impl_resource!(TravelPlan, ResourceKind::TravelPlans);
impl_resource!(MonthlyBudget, ResourceKind::MonthlyBudgets);

impl Resource for Movie {
  fn kind() -> ResourceKind {
    ResourceKind::Movies
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn workspace_id(&self) -> &str {
    &self.workspace_id
  }

  fn author_id(&self) -> Option<&str> {
    Some(&self.author_id)
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    None
  }
}

impl Resource for ExpenseCategory {
  fn kind() -> ResourceKind {
    ResourceKind::ExpenseCategories
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn workspace_id(&self) -> &str {
    &self.workspace_id
  }

  fn author_id(&self) -> Option<&str> {
    None
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    None
  }
}
