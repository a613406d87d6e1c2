//! Workspace reads and writes with offline support.
//!
//! Reads go through the cache layer. Direct writes by a record's author go to
//! the remote store, or into the offline queue when it cannot be reached;
//! everyone else's writes become approval requests.

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::approval::{merge_fields, ApprovalBackend, ApprovalEngine, ApprovalError, EditOperation};
use crate::cache::{CacheKey, CacheLayer, CacheStorage, FetchOptions, Fetched, SqliteStorage};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::db::{Database, StoreError};
use crate::queue::{QueueOp, QueuedMutation, SyncQueue};
use crate::realtime::{LiveCollection, Reload, Subscription, SubscriptionManager};
use crate::remote::{Filter, RemoteError, RemoteStore};
use crate::resource::{reserialize, row_str, Resource, ResourceKind, Row};
use crate::session::Session;

/// Default lifetime of cached collections.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SyncError {
  #[error("{op} failed: {source}")]
  Remote {
    op: &'static str,
    #[source]
    source: RemoteError,
  },
  #[error(transparent)]
  Approval(#[from] ApprovalError),
  #[error("local store error: {0}")]
  Store(#[from] StoreError),
  #[error("{kind} {id} not found")]
  NotFound { kind: ResourceKind, id: String },
  #[error("{op} needs a connection; approval requests are not queued")]
  RequiresConnection { op: &'static str },
  #[error("invalid record: {0}")]
  InvalidRecord(String),
}

/// What happened to a create, edit or delete.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// Written to the remote store; carries the stored row
  Applied(Row),
  /// Recorded for replay; carries the queue id
  Queued(i64),
  Deleted,
  /// Filed for the author's approval; carries the pending edit id
  Requested(String),
}

/// Per-call read settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
  pub filters: Vec<Filter>,
  pub ttl: Option<Duration>,
  pub skip_cache: bool,
}

#[derive(Debug)]
pub struct ReplayFailure {
  pub mutation_id: i64,
  pub error: RemoteError,
}

#[derive(Debug, Default)]
pub struct ReplayReport {
  pub synced: Vec<i64>,
  /// Refused for good and set aside; later mutations were still replayed
  pub failed: Vec<ReplayFailure>,
  /// Transient failure that ended the pass; it and everything after it stay queued
  pub interrupted: Option<ReplayFailure>,
}

/// The record a mutation targets, and where it was read from.
enum Target {
  Live(Row),
  Cached(Row),
}

pub struct SyncEngine {
  session: Arc<Session>,
  remote: Arc<dyn RemoteStore>,
  cache: CacheLayer<SqliteStorage>,
  queue: SyncQueue,
  approvals: ApprovalEngine,
  connectivity: Arc<ConnectivityMonitor>,
  default_ttl: Duration,
  replaying: Mutex<()>,
}

impl SyncEngine {
  pub fn new(
    session: Arc<Session>,
    remote: Arc<dyn RemoteStore>,
    backend: Arc<dyn ApprovalBackend>,
    db: Database,
    connectivity: Arc<ConnectivityMonitor>,
  ) -> Self {
    let approvals = ApprovalEngine::new(Arc::clone(&session), Arc::clone(&remote), backend);
    Self {
      session,
      remote,
      cache: CacheLayer::new(SqliteStorage::new(db.clone())),
      queue: SyncQueue::new(db),
      approvals,
      connectivity,
      default_ttl: DEFAULT_TTL,
      replaying: Mutex::new(()),
    }
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_storage(mut self, storage: SqliteStorage) -> Self {
    self.cache = CacheLayer::new(storage);
    self
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  pub fn cache(&self) -> &CacheLayer<SqliteStorage> {
    &self.cache
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn approvals(&self) -> &ApprovalEngine {
    &self.approvals
  }

  /// Typed cache-first read of a collection in the session's workspace.
  pub async fn load<T: Resource>(&self, options: &LoadOptions) -> Result<Fetched<Vec<T>>, SyncError> {
    self.load_as(T::kind(), options).await
  }

  /// Untyped cache-first read, for callers that pick the collection at runtime.
  pub async fn load_rows(
    &self,
    kind: ResourceKind,
    options: &LoadOptions,
  ) -> Result<Fetched<Vec<Row>>, SyncError> {
    self.load_as(kind, options).await
  }

  async fn load_as<T>(&self, kind: ResourceKind, options: &LoadOptions) -> Result<Fetched<Vec<T>>, SyncError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let mut filters = vec![self.session.workspace_filter()];
    filters.extend(options.filters.iter().cloned());

    let key = CacheKey::filtered(kind, &self.session.workspace_id, &filters);
    let fetch = FetchOptions::new(key, Some(options.ttl.unwrap_or(self.default_ttl)))
      .skip_cache(options.skip_cache);
    let remote = Arc::clone(&self.remote);

    self
      .cache
      .fetch_with_cache(&fetch, move || async move {
        let rows = remote.select(kind, &filters).await?;
        reserialize::<Vec<T>>(rows).map_err(|e| RemoteError::Decode(e.to_string()))
      })
      .await
      .map_err(|source| SyncError::Remote { op: "load", source })
  }

  /// Cache-first load of a whole collection, kept current by the change feed.
  ///
  /// Every reopen of the channel reads the collection again from the network
  /// (refreshing the cache) and merges it in, so changes made during the gap
  /// are not lost.
  pub async fn watch<T: Resource>(
    self: &Arc<Self>,
    manager: &SubscriptionManager,
  ) -> Result<(LiveCollection<T>, Subscription), SyncError> {
    let fetched = self.load::<T>(&LoadOptions::default()).await?;
    let live = LiveCollection::new(fetched.result.data);
    if let Some(revalidation) = fetched.revalidation {
      let live = live.clone();
      tokio::spawn(async move {
        if let Some(fresh) = revalidation.fresh().await {
          live.replace_all(fresh);
        }
      });
    }

    let engine = Arc::clone(self);
    let reload: Reload = Arc::new(move || {
      let engine = Arc::clone(&engine);
      async move {
        let options = LoadOptions {
          skip_cache: true,
          ..LoadOptions::default()
        };
        let fetched = engine
          .load_rows(T::kind(), &options)
          .await
          .map_err(|e| match e {
            SyncError::Remote { source, .. } => source,
            other => RemoteError::Decode(other.to_string()),
          })?;
        if fetched.result.is_stale() {
          return Err(RemoteError::Transient(format!("{} reload served from cache", T::kind())));
        }
        Ok::<_, RemoteError>(fetched.result.data)
      }
      .boxed()
    });

    let subscription = manager.subscribe_with_reload(T::kind(), None, live.clone(), reload);
    Ok((live, subscription))
  }

  /// Create a record authored by the current user.
  ///
  /// Missing `id`, `workspace_id` and author fields are filled in; the id is
  /// generated locally so an offline create can be replayed as-is.
  pub async fn create(&self, kind: ResourceKind, record: Row) -> Result<MutationOutcome, SyncError> {
    let mut record = record;
    let fields = record
      .as_object_mut()
      .ok_or_else(|| SyncError::InvalidRecord(format!("{} record must be an object", kind)))?;
    fields
      .entry("id")
      .or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
    fields.insert("workspace_id".to_string(), json!(self.session.workspace_id));
    if let Some(column) = kind.author_column() {
      fields.insert(column.to_string(), json!(self.session.user_id));
    }
    let id = row_str(&record, "id")
      .ok_or_else(|| SyncError::InvalidRecord("id must be a string".to_string()))?
      .to_string();

    if !self.connectivity.is_online() {
      return self.enqueue(kind, &id, QueueOp::Create, &record);
    }

    match self.remote.insert(kind, record.clone()).await {
      Ok(created) => {
        self.invalidate(kind);
        Ok(MutationOutcome::Applied(created))
      }
      Err(e) if e.is_transient() => {
        warn!(kind = %kind, id = %id, error = %e, "create failed, queued for later");
        self.enqueue(kind, &id, QueueOp::Create, &record)
      }
      Err(source) => Err(SyncError::Remote { op: "create", source }),
    }
  }

  /// Change fields of a record.
  ///
  /// The author's edit is applied (or queued); anyone else's is filed for approval.
  pub async fn edit(
    &self,
    kind: ResourceKind,
    id: &str,
    changes: Row,
    rationale: Option<String>,
  ) -> Result<MutationOutcome, SyncError> {
    if !changes.is_object() {
      return Err(SyncError::InvalidRecord("changes must be an object".to_string()));
    }

    let current = match self.target(kind, id, "edit").await? {
      Target::Cached(current) => {
        return if self.session.is_author(kind, &current) {
          self.enqueue(kind, id, QueueOp::Update, &changes)
        } else {
          Err(SyncError::RequiresConnection { op: "request edit" })
        };
      }
      Target::Live(current) => current,
    };

    if !self.session.is_author(kind, &current) {
      let proposed = merge_fields(&current, &changes);
      return self
        .request(kind, id, current, EditOperation::Edit, Some(proposed), rationale)
        .await;
    }
    if !self.drain_before_write(kind, id).await? {
      return self.enqueue(kind, id, QueueOp::Update, &changes);
    }

    match self.remote.update(kind, id, changes.clone()).await {
      Ok(updated) => {
        self.invalidate(kind);
        Ok(MutationOutcome::Applied(updated))
      }
      Err(RemoteError::Unauthorized(reason)) => {
        debug!(kind = %kind, id, reason = %reason, "direct edit refused, requesting approval");
        let proposed = merge_fields(&current, &changes);
        self
          .request(kind, id, current, EditOperation::Edit, Some(proposed), rationale)
          .await
      }
      Err(e) if e.is_transient() => {
        warn!(kind = %kind, id, error = %e, "edit failed, queued for later");
        self.enqueue(kind, id, QueueOp::Update, &changes)
      }
      Err(source) => Err(SyncError::Remote { op: "edit", source }),
    }
  }

  /// Delete a record, directly for its author and by request for anyone else.
  pub async fn delete(
    &self,
    kind: ResourceKind,
    id: &str,
    rationale: Option<String>,
  ) -> Result<MutationOutcome, SyncError> {
    let current = match self.target(kind, id, "delete").await? {
      Target::Cached(current) => {
        return if self.session.is_author(kind, &current) {
          self.enqueue(kind, id, QueueOp::Delete, &current)
        } else {
          Err(SyncError::RequiresConnection { op: "request delete" })
        };
      }
      Target::Live(current) => current,
    };

    if !self.session.is_author(kind, &current) {
      return self
        .request(kind, id, current, EditOperation::Delete, None, rationale)
        .await;
    }
    if !self.drain_before_write(kind, id).await? {
      return self.enqueue(kind, id, QueueOp::Delete, &current);
    }

    match self.remote.delete(kind, id).await {
      Ok(()) => {
        self.invalidate(kind);
        Ok(MutationOutcome::Deleted)
      }
      Err(RemoteError::Unauthorized(reason)) => {
        debug!(kind = %kind, id, reason = %reason, "direct delete refused, requesting approval");
        self
          .request(kind, id, current, EditOperation::Delete, None, rationale)
          .await
      }
      Err(e) if e.is_transient() => {
        warn!(kind = %kind, id, error = %e, "delete failed, queued for later");
        self.enqueue(kind, id, QueueOp::Delete, &current)
      }
      Err(source) => Err(SyncError::Remote { op: "delete", source }),
    }
  }

  /// Push queued mutations to the remote store in the order they were made.
  ///
  /// A transient failure ends the pass so later mutations never overtake it.
  /// A mutation the server refuses outright is marked failed and skipped.
  pub async fn replay_queue(&self) -> Result<ReplayReport, SyncError> {
    let _guard = self.replaying.lock().await;
    let pending = self.queue.pending()?;
    let mut report = ReplayReport::default();
    let mut touched: Vec<ResourceKind> = Vec::new();

    if pending.is_empty() {
      return Ok(report);
    }
    info!(count = pending.len(), "replaying queued mutations");

    for mutation in pending {
      match self.replay_one(&mutation).await {
        Ok(()) => {
          self.queue.mark_synced(mutation.id)?;
          debug!(id = mutation.id, kind = %mutation.resource_kind, op = %mutation.operation, "queued mutation synced");
          report.synced.push(mutation.id);
          if !touched.contains(&mutation.resource_kind) {
            touched.push(mutation.resource_kind);
          }
        }
        Err(e) if e.is_transient() => {
          warn!(
            id = mutation.id,
            kind = %mutation.resource_kind,
            resource_id = %mutation.resource_id,
            error = %e,
            "replay interrupted, leaving remaining mutations queued"
          );
          report.interrupted = Some(ReplayFailure {
            mutation_id: mutation.id,
            error: e,
          });
          break;
        }
        Err(e) => {
          error!(
            id = mutation.id,
            kind = %mutation.resource_kind,
            resource_id = %mutation.resource_id,
            op = %mutation.operation,
            error = %e,
            "queued mutation refused, setting it aside"
          );
          self.queue.mark_failed(mutation.id, &e.to_string())?;
          report.failed.push(ReplayFailure {
            mutation_id: mutation.id,
            error: e,
          });
        }
      }
    }

    for kind in touched {
      self.invalidate(kind);
    }
    Ok(report)
  }

  async fn replay_one(&self, mutation: &QueuedMutation) -> Result<(), RemoteError> {
    let kind = mutation.resource_kind;
    let result = match mutation.operation {
      QueueOp::Create => self.remote.insert(kind, mutation.payload.clone()).await.map(|_| ()),
      QueueOp::Update => self
        .remote
        .update(kind, &mutation.resource_id, mutation.payload.clone())
        .await
        .map(|_| ()),
      QueueOp::Delete => self.remote.delete(kind, &mutation.resource_id).await,
    };

    // A create or delete already applied by an earlier, interrupted replay
    match (mutation.operation, result) {
      (QueueOp::Create, Err(RemoteError::Rejected { status: 409, .. })) => Ok(()),
      (QueueOp::Delete, Err(RemoteError::NotFound(_))) => Ok(()),
      (_, result) => result,
    }
  }

  /// Replay first when `id` still has queued mutations, so a direct write
  /// lands after them. Returns false if they could not all be replayed.
  async fn drain_before_write(&self, kind: ResourceKind, id: &str) -> Result<bool, SyncError> {
    if !self.queue.has_pending(kind, id)? {
      return Ok(true);
    }
    debug!(kind = %kind, id, "record has queued changes, replaying them first");
    self.replay_queue().await?;
    Ok(!self.queue.has_pending(kind, id)?)
  }

  /// Replay the queue on every reconnect until the monitor goes away.
  ///
  /// The listener is registered before this returns.
  pub fn spawn_reconnect_handler(self: &Arc<Self>) -> JoinHandle<()> {
    let engine = Arc::clone(self);
    let mut events = self.connectivity.subscribe();

    tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(ConnectivityEvent::Reconnected) | Err(RecvError::Lagged(_)) => {
            match engine.replay_queue().await {
              Ok(report) if !report.synced.is_empty() => {
                info!(synced = report.synced.len(), "offline changes synced")
              }
              Ok(_) => {}
              Err(e) => error!(error = %e, "failed to replay offline changes"),
            }
          }
          Ok(ConnectivityEvent::WentOffline) => {}
          Err(RecvError::Closed) => return,
        }
      }
    })
  }

  async fn request(
    &self,
    kind: ResourceKind,
    id: &str,
    current: Row,
    operation: EditOperation,
    proposed: Option<Row>,
    rationale: Option<String>,
  ) -> Result<MutationOutcome, SyncError> {
    let edit_id = self
      .approvals
      .request(kind, id, current, operation, proposed, rationale)
      .await?;
    Ok(MutationOutcome::Requested(edit_id))
  }

  fn enqueue(&self, kind: ResourceKind, id: &str, op: QueueOp, payload: &Row) -> Result<MutationOutcome, SyncError> {
    let queued = self.queue.enqueue(kind, id, op, payload)?;
    Ok(MutationOutcome::Queued(queued))
  }

  /// Read the record a mutation targets, from the cached collection when the
  /// remote store is unreachable.
  async fn target(&self, kind: ResourceKind, id: &str, op: &'static str) -> Result<Target, SyncError> {
    let error = if self.connectivity.is_online() {
      match self.remote.get(kind, id).await {
        Ok(Some(row)) => return Ok(Target::Live(row)),
        Ok(None) => {
          return Err(SyncError::NotFound {
            kind,
            id: id.to_string(),
          })
        }
        Err(e) if e.is_transient() => e,
        Err(source) => return Err(SyncError::Remote { op, source }),
      }
    } else {
      RemoteError::Transient("offline".to_string())
    };

    match self.cached_record(kind, id) {
      Some(row) => {
        debug!(kind = %kind, id, "using cached record while offline");
        Ok(Target::Cached(row))
      }
      None => Err(SyncError::Remote { op, source: error }),
    }
  }

  fn cached_record(&self, kind: ResourceKind, id: &str) -> Option<Row> {
    let key = CacheKey::collection(kind, &self.session.workspace_id);
    match self.cache.storage().get_entry::<Vec<Value>>(key.as_str()) {
      Ok(entry) => entry?
        .data
        .into_iter()
        .find(|row| row_str(row, "id") == Some(id)),
      Err(e) => {
        warn!(key = %key, error = %e, "failed to read cached collection");
        None
      }
    }
  }

  /// Drop every cached read of `kind` so the next load goes to the network.
  fn invalidate(&self, kind: ResourceKind) {
    let namespace = CacheKey::collection(kind, &self.session.workspace_id);
    if let Err(e) = self.cache.storage().delete_namespace(namespace.as_str()) {
      warn!(namespace = %namespace, error = %e, "failed to invalidate cache");
    }
  }
}
