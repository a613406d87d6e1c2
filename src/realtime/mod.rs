//! Change-feed subscriptions.
//!
//! One push channel per (resource kind, filter), scoped to the session's
//! workspace. Deltas are applied through a [`ChangeHandler`]; dropped channels
//! are reopened after a fixed delay for as long as the subscription lives.
//! Changes made while a channel was down are not replayed by the server, so a
//! subscription with a [`Reload`] re-reads the whole collection on every reopen.

mod live;
mod manager;
mod phoenix;

pub use live::LiveCollection;
pub use manager::{Subscription, SubscriptionManager, RECONNECT_DELAY};
pub use phoenix::RealtimeTransport;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::remote::{Filter, RemoteError};
use crate::resource::{ResourceKind, Row};

/// One event delivered on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
  /// Full new state of the record
  Insert(Row),
  /// Full current state of the record
  Update(Row),
  /// Final prior state of the record
  Delete(Row),
  /// The server or socket closed the channel
  Closed,
}

/// What a channel listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
  pub kind: ResourceKind,
  pub filter: Filter,
}

impl ChannelSpec {
  pub fn new(kind: ResourceKind, filter: Filter) -> Self {
    Self { kind, filter }
  }

  pub fn topic(&self) -> String {
    format!("{}:{}", self.kind.table(), self.filter.to_expression())
  }
}

/// Stream of events from one open channel, in server delivery order.
pub type FeedChannel = BoxStream<'static, FeedMessage>;

/// Push-feed transport able to open filtered channels.
#[async_trait]
pub trait FeedTransport: Send + Sync {
  async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, RemoteError>;
}

/// Full read of a subscribed collection, run after a channel reopens.
pub type Reload = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Row>, RemoteError>> + Send + Sync>;

/// Receives deltas for one subscription.
///
/// Callbacks run with the subscription's gate held. A callback may drop or
/// unsubscribe its own subscription; no further callback runs after that.
pub trait ChangeHandler: Send + 'static {
  fn on_insert(&mut self, row: Row);

  fn on_update(&mut self, row: Row);

  fn on_delete(&mut self, row: Row);

  /// Whole collection as reloaded after a gap in the feed.
  fn on_resync(&mut self, _rows: Vec<Row>) {}
}

type RowCallback = Box<dyn FnMut(Row) + Send>;

/// Closure-based [`ChangeHandler`]; unset callbacks ignore their events.
#[derive(Default)]
pub struct Callbacks {
  insert: Option<RowCallback>,
  update: Option<RowCallback>,
  delete: Option<RowCallback>,
}

impl Callbacks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_insert(mut self, f: impl FnMut(Row) + Send + 'static) -> Self {
    self.insert = Some(Box::new(f));
    self
  }

  pub fn on_update(mut self, f: impl FnMut(Row) + Send + 'static) -> Self {
    self.update = Some(Box::new(f));
    self
  }

  pub fn on_delete(mut self, f: impl FnMut(Row) + Send + 'static) -> Self {
    self.delete = Some(Box::new(f));
    self
  }
}

impl ChangeHandler for Callbacks {
  fn on_insert(&mut self, row: Row) {
    if let Some(f) = self.insert.as_mut() {
      f(row);
    }
  }

  fn on_update(&mut self, row: Row) {
    if let Some(f) = self.update.as_mut() {
      f(row);
    }
  }

  fn on_delete(&mut self, row: Row) {
    if let Some(f) = self.delete.as_mut() {
      f(row);
    }
  }
}
