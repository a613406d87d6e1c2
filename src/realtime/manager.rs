//! Supervised, cancellable change-feed subscriptions.

use futures::StreamExt;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{ChangeHandler, ChannelSpec, FeedChannel, FeedMessage, FeedTransport, Reload};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::remote::Filter;
use crate::resource::{row_str, ResourceKind};
use crate::session::Session;

/// Default fixed delay before reopening a dropped channel.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Opens change-feed subscriptions for one session.
pub struct SubscriptionManager {
  transport: Arc<dyn FeedTransport>,
  session: Arc<Session>,
  reconnect_delay: Duration,
  connectivity: Option<Arc<ConnectivityMonitor>>,
}

impl SubscriptionManager {
  pub fn new(transport: Arc<dyn FeedTransport>, session: Arc<Session>) -> Self {
    Self {
      transport,
      session,
      reconnect_delay: RECONNECT_DELAY,
      connectivity: None,
    }
  }

  pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
    self.reconnect_delay = delay;
    self
  }

  /// Reopen live channels whenever the monitor reports a reconnect.
  pub fn with_connectivity(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
    self.connectivity = Some(monitor);
    self
  }

  /// Subscribe to changes of `kind`.
  ///
  /// `filter` defaults to the session's workspace. Rows that belong to another
  /// workspace are dropped before reaching the handler.
  pub fn subscribe<H: ChangeHandler>(
    &self,
    kind: ResourceKind,
    filter: Option<Filter>,
    handler: H,
  ) -> Subscription {
    self.spawn(kind, filter, handler, None)
  }

  /// Like [`subscribe`](Self::subscribe), and after every reopen of the
  /// channel run `reload` and hand its rows to [`ChangeHandler::on_resync`].
  ///
  /// The reload starts once the new channel is open, so nothing changed in
  /// between is missed.
  pub fn subscribe_with_reload<H: ChangeHandler>(
    &self,
    kind: ResourceKind,
    filter: Option<Filter>,
    handler: H,
    reload: Reload,
  ) -> Subscription {
    self.spawn(kind, filter, handler, Some(reload))
  }

  fn spawn<H: ChangeHandler>(
    &self,
    kind: ResourceKind,
    filter: Option<Filter>,
    handler: H,
    reload: Option<Reload>,
  ) -> Subscription {
    let spec = ChannelSpec::new(kind, filter.unwrap_or_else(|| self.session.workspace_filter()));
    let topic = spec.topic();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gate = Arc::new(Gate::new());

    let worker = Worker {
      transport: Arc::clone(&self.transport),
      spec,
      workspace_id: self.session.workspace_id.clone(),
      delay: self.reconnect_delay,
      gate: Arc::clone(&gate),
      shutdown: shutdown_rx,
      reconnects: self.connectivity.as_ref().map(|m| m.subscribe()),
      reload,
    };
    let task = tokio::spawn(worker.run(handler));

    Subscription {
      topic,
      gate,
      shutdown: Some(shutdown_tx),
      task: Some(task),
    }
  }
}

thread_local! {
  /// Address of the gate whose callback is running on this thread, or 0.
  static RUNNING_GATE: Cell<usize> = const { Cell::new(0) };
}

/// Orders callbacks against unsubscribe.
struct Gate {
  open: AtomicBool,
  running: Mutex<()>,
}

impl Gate {
  fn new() -> Self {
    Self {
      open: AtomicBool::new(true),
      running: Mutex::new(()),
    }
  }

  fn id(&self) -> usize {
    self as *const Gate as usize
  }

  fn is_open(&self) -> bool {
    self.open.load(Ordering::Acquire)
  }

  /// Run `callback` unless the gate is closed. Returns false once closed.
  fn run(&self, callback: impl FnOnce()) -> bool {
    let _running = self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if !self.is_open() {
      return false;
    }
    let _marker = RunningMarker::enter(self.id());
    callback();
    true
  }

  /// Close the gate. Waits for a callback running on another thread; from
  /// inside this gate's own callback it returns at once.
  fn close(&self) {
    self.open.store(false, Ordering::Release);
    if RUNNING_GATE.with(|running| running.get()) != self.id() {
      drop(self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }
  }
}

struct RunningMarker {
  previous: usize,
}

impl RunningMarker {
  fn enter(gate: usize) -> Self {
    Self {
      previous: RUNNING_GATE.with(|running| running.replace(gate)),
    }
  }
}

impl Drop for RunningMarker {
  fn drop(&mut self) {
    RUNNING_GATE.with(|running| running.set(self.previous));
  }
}

/// Handle to a live subscription. Dropping it unsubscribes.
pub struct Subscription {
  topic: String,
  gate: Arc<Gate>,
  shutdown: Option<watch::Sender<bool>>,
  task: Option<JoinHandle<()>>,
}

impl Subscription {
  pub fn topic(&self) -> &str {
    &self.topic
  }

  /// Whether the supervising task is still running.
  pub fn is_active(&self) -> bool {
    self.task.as_ref().is_some_and(|task| !task.is_finished())
  }

  /// Tear the channel down. No callback runs after this returns.
  pub fn unsubscribe(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    self.gate.close();
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(true);
    }
    if let Some(task) = self.task.take() {
      task.abort();
      debug!(topic = %self.topic, "unsubscribed");
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.stop();
  }
}

enum ChannelEnd {
  Closed,
  Resync,
  Shutdown,
}

struct Worker {
  transport: Arc<dyn FeedTransport>,
  spec: ChannelSpec,
  workspace_id: String,
  delay: Duration,
  gate: Arc<Gate>,
  shutdown: watch::Receiver<bool>,
  reconnects: Option<broadcast::Receiver<ConnectivityEvent>>,
  reload: Option<Reload>,
}

impl Worker {
  async fn run<H: ChangeHandler>(mut self, mut handler: H) {
    let topic = self.spec.topic();
    let mut opened_before = false;

    loop {
      if *self.shutdown.borrow() {
        return;
      }

      let opened = tokio::select! {
        biased;
        _ = self.shutdown.changed() => return,
        opened = self.transport.open(&self.spec) => opened,
      };

      match opened {
        Ok(channel) => {
          info!(topic = %topic, "real-time subscription active");
          if opened_before && !self.resync(&mut handler).await {
            return;
          }
          opened_before = true;
          match self.pump(channel, &mut handler).await {
            ChannelEnd::Shutdown => return,
            ChannelEnd::Resync => {
              info!(topic = %topic, "reconnected, reopening channel");
              continue;
            }
            ChannelEnd::Closed => {
              warn!(topic = %topic, delay = ?self.delay, "real-time subscription closed, retrying")
            }
          }
        }
        Err(e) => warn!(topic = %topic, error = %e, delay = ?self.delay, "failed to open subscription"),
      }

      tokio::select! {
        biased;
        _ = self.shutdown.changed() => return,
        _ = tokio::time::sleep(self.delay) => {}
      }
    }
  }

  async fn pump<H: ChangeHandler>(&mut self, mut channel: FeedChannel, handler: &mut H) -> ChannelEnd {
    loop {
      let message = tokio::select! {
        biased;
        _ = self.shutdown.changed() => return ChannelEnd::Shutdown,
        _ = next_reconnect(&mut self.reconnects) => return ChannelEnd::Resync,
        message = channel.next() => message,
      };

      match message {
        None | Some(FeedMessage::Closed) => return ChannelEnd::Closed,
        Some(message) => {
          if !self.deliver(message, handler) {
            return ChannelEnd::Shutdown;
          }
        }
      }
    }
  }

  /// Reload the collection and hand it to the handler. Returns false once unsubscribed.
  async fn resync<H: ChangeHandler>(&mut self, handler: &mut H) -> bool {
    let Some(reload) = self.reload.clone() else {
      return true;
    };
    let topic = self.spec.topic();

    let reloaded = tokio::select! {
      biased;
      _ = self.shutdown.changed() => return false,
      reloaded = reload() => reloaded,
    };
    let rows = match reloaded {
      Ok(rows) => rows,
      Err(e) => {
        warn!(topic = %topic, error = %e, "reload after reopen failed, keeping current view");
        return true;
      }
    };

    let rows: Vec<_> = rows
      .into_iter()
      .filter(|row| row_str(row, "workspace_id").map_or(true, |workspace| workspace == self.workspace_id))
      .collect();
    debug!(topic = %topic, count = rows.len(), "resynced after reopen");
    self.gate.run(|| handler.on_resync(rows))
  }

  /// Hand one event to the handler. Returns false once unsubscribed.
  fn deliver<H: ChangeHandler>(&self, message: FeedMessage, handler: &mut H) -> bool {
    if !self.gate.is_open() {
      return false;
    }

    let row = match &message {
      FeedMessage::Insert(row) | FeedMessage::Update(row) | FeedMessage::Delete(row) => row,
      FeedMessage::Closed => return true,
    };
    if let Some(workspace) = row_str(row, "workspace_id") {
      if workspace != self.workspace_id {
        trace!(workspace, "dropping change for another workspace");
        return true;
      }
    }

    self.gate.run(|| match message {
      FeedMessage::Insert(row) => handler.on_insert(row),
      FeedMessage::Update(row) => handler.on_update(row),
      FeedMessage::Delete(row) => handler.on_delete(row),
      FeedMessage::Closed => {}
    })
  }
}

/// Resolves on the next reconnect broadcast; never if there is no monitor.
async fn next_reconnect(rx: &mut Option<broadcast::Receiver<ConnectivityEvent>>) {
  match rx {
    Some(rx) => loop {
      match rx.recv().await {
        Ok(ConnectivityEvent::Reconnected) => return,
        Ok(ConnectivityEvent::WentOffline) => continue,
        // Missed transitions; resync to be safe
        Err(RecvError::Lagged(_)) => return,
        Err(RecvError::Closed) => futures::future::pending::<()>().await,
      }
    },
    None => futures::future::pending::<()>().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::Connectivity;
  use crate::realtime::Callbacks;
  use crate::remote::RemoteStore;
  use crate::testing::MemoryBackend;
  use futures::FutureExt;
  use serde_json::{json, Value};
  use std::sync::Mutex as StdMutex;

  fn recorder() -> (Callbacks, Arc<StdMutex<Vec<String>>>) {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let (a, b, c) = (log.clone(), log.clone(), log.clone());
    let callbacks = Callbacks::new()
      .on_insert(move |row: Value| a.lock().unwrap().push(format!("insert {}", row["id"])))
      .on_update(move |row: Value| b.lock().unwrap().push(format!("update {}", row["id"])))
      .on_delete(move |row: Value| c.lock().unwrap().push(format!("delete {}", row["id"])));
    (callbacks, log)
  }

  async fn settle() {
    for _ in 0..20 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_events_arrive_in_delivery_order() {
    let backend = MemoryBackend::new();
    let session = Arc::new(Session::new("alice", "ws1"));
    let manager = SubscriptionManager::new(backend.feed(), session);
    let (callbacks, log) = recorder();

    let _sub = manager.subscribe(ResourceKind::Notes, None, callbacks);
    settle().await;

    backend.push(ResourceKind::Notes, FeedMessage::Insert(json!({"id": "n1", "workspace_id": "ws1"})));
    backend.push(ResourceKind::Notes, FeedMessage::Update(json!({"id": "n1", "workspace_id": "ws1"})));
    backend.push(ResourceKind::Notes, FeedMessage::Delete(json!({"id": "n1", "workspace_id": "ws1"})));
    settle().await;

    assert_eq!(
      *log.lock().unwrap(),
      vec![r#"insert "n1""#, r#"update "n1""#, r#"delete "n1""#]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_other_workspace_rows_are_dropped() {
    let backend = MemoryBackend::new();
    let session = Arc::new(Session::new("alice", "ws1"));
    let manager = SubscriptionManager::new(backend.feed(), session);
    let (callbacks, log) = recorder();

    let _sub = manager.subscribe(ResourceKind::Notes, Some(Filter::eq("author_id", "bob")), callbacks);
    settle().await;

    backend.push(ResourceKind::Notes, FeedMessage::Insert(json!({"id": "x", "workspace_id": "ws2"})));
    backend.push(ResourceKind::Notes, FeedMessage::Insert(json!({"id": "y", "workspace_id": "ws1"})));
    settle().await;

    assert_eq!(*log.lock().unwrap(), vec![r#"insert "y""#]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_channel_retries_after_fixed_delay() {
    let backend = MemoryBackend::new();
    let session = Arc::new(Session::new("alice", "ws1"));
    let manager = SubscriptionManager::new(backend.feed(), session);
    let (callbacks, _log) = recorder();

    let sub = manager.subscribe(ResourceKind::Expenses, None, callbacks);
    settle().await;
    assert_eq!(backend.open_count(), 1);

    backend.close_channels();
    settle().await;

    tokio::time::advance(Duration::from_millis(4_999)).await;
    settle().await;
    assert_eq!(backend.open_count(), 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    settle().await;
    assert_eq!(backend.open_count(), 2);
    assert!(sub.is_active());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_opens_retry_indefinitely() {
    let backend = MemoryBackend::new();
    backend.fail_opens(3);
    let session = Arc::new(Session::new("alice", "ws1"));
    let manager = SubscriptionManager::new(backend.feed(), session);
    let (callbacks, log) = recorder();

    let _sub = manager.subscribe(ResourceKind::Tasks, None, callbacks);
    for _ in 0..4 {
      settle().await;
      tokio::time::advance(RECONNECT_DELAY).await;
    }
    settle().await;

    assert_eq!(backend.open_count(), 4);
    backend.push(ResourceKind::Tasks, FeedMessage::Insert(json!({"id": "t1", "workspace_id": "ws1"})));
    settle().await;
    assert_eq!(*log.lock().unwrap(), vec![r#"insert "t1""#]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribe_stops_delivery_and_retries() {
    let backend = MemoryBackend::new();
    let session = Arc::new(Session::new("alice", "ws1"));
    let manager = SubscriptionManager::new(backend.feed(), session);
    let (callbacks, log) = recorder();

    let sub = manager.subscribe(ResourceKind::Notes, None, callbacks);
    settle().await;
    backend.close_channels();
    settle().await;

    sub.unsubscribe();
    backend.push(ResourceKind::Notes, FeedMessage::Insert(json!({"id": "n1", "workspace_id": "ws1"})));
    tokio::time::advance(RECONNECT_DELAY * 3).await;
    settle().await;

    assert_eq!(backend.open_count(), 1);
    assert!(log.lock().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_callback_may_drop_its_own_subscription() {
    let backend = MemoryBackend::new();
    let session = Arc::new(Session::new("alice", "ws1"));
    let manager = SubscriptionManager::new(backend.feed(), session);
    let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let (held, log) = (slot.clone(), seen.clone());
    let callbacks = Callbacks::new().on_insert(move |row: Value| {
      log.lock().unwrap().push(row["id"].to_string());
      drop(held.lock().unwrap().take());
    });
    *slot.lock().unwrap() = Some(manager.subscribe(ResourceKind::Notes, None, callbacks));
    settle().await;

    backend.push(ResourceKind::Notes, FeedMessage::Insert(json!({"id": "n1", "workspace_id": "ws1"})));
    backend.push(ResourceKind::Notes, FeedMessage::Insert(json!({"id": "n2", "workspace_id": "ws1"})));
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![r#""n1""#]);
    assert!(slot.lock().unwrap().is_none());
  }

  struct ResyncRecorder(Arc<StdMutex<Vec<usize>>>);

  impl ChangeHandler for ResyncRecorder {
    fn on_insert(&mut self, _row: Value) {}

    fn on_update(&mut self, _row: Value) {}

    fn on_delete(&mut self, _row: Value) {}

    fn on_resync(&mut self, rows: Vec<Value>) {
      self.0.lock().unwrap().push(rows.len());
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_reopened_channel_reloads_the_collection() {
    let backend = MemoryBackend::new();
    backend.seed(ResourceKind::Notes, json!({"id": "n1", "workspace_id": "ws1"}));
    let session = Arc::new(Session::new("alice", "ws1"));
    let manager = SubscriptionManager::new(backend.feed(), session);
    let resyncs = Arc::new(StdMutex::new(Vec::new()));

    let store = backend.clone();
    let reload: Reload = Arc::new(move || {
      let store = store.clone();
      async move { store.select(ResourceKind::Notes, &[]).await }.boxed()
    });
    let _sub = manager.subscribe_with_reload(
      ResourceKind::Notes,
      None,
      ResyncRecorder(resyncs.clone()),
      reload,
    );
    settle().await;
    assert!(resyncs.lock().unwrap().is_empty());

    backend.close_channels();
    settle().await;
    // Written while the channel is down; no event reaches anyone
    backend.seed(ResourceKind::Notes, json!({"id": "n2", "workspace_id": "ws1"}));
    backend.seed(ResourceKind::Notes, json!({"id": "x", "workspace_id": "ws2"}));

    tokio::time::advance(RECONNECT_DELAY + Duration::from_millis(1)).await;
    settle().await;

    assert_eq!(backend.open_count(), 2);
    assert_eq!(*resyncs.lock().unwrap(), vec![2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_forces_channel_reopen() {
    let backend = MemoryBackend::new();
    let session = Arc::new(Session::new("alice", "ws1"));
    let monitor = Arc::new(ConnectivityMonitor::new(Connectivity::Online));
    let manager = SubscriptionManager::new(backend.feed(), session).with_connectivity(monitor.clone());
    let (callbacks, _log) = recorder();

    let _sub = manager.subscribe(ResourceKind::Notes, None, callbacks);
    settle().await;

    monitor.report(Connectivity::Offline);
    monitor.report(Connectivity::Online);
    settle().await;

    assert_eq!(backend.open_count(), 2);
  }
}
