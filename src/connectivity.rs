//! Online/offline tracking driven by a platform reachability signal.
//!
//! The monitor never probes the network itself; it only reacts to the
//! transitions it is told about, so detection latency is the signal's.

use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

impl Connectivity {
  pub fn from_reachable(reachable: bool) -> Self {
    if reachable {
      Connectivity::Online
    } else {
      Connectivity::Offline
    }
  }
}

/// Broadcast on each state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  /// Offline -> Online; listeners should resync
  Reconnected,
  /// Online -> Offline; advisory only
  WentOffline,
}

pub struct ConnectivityMonitor {
  state: watch::Sender<Connectivity>,
  events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity) -> Self {
    let (state, _) = watch::channel(initial);
    let (events, _) = broadcast::channel(16);
    Self { state, events }
  }

  pub fn status(&self) -> Connectivity {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.status() == Connectivity::Online
  }

  /// Current status plus change notifications, for ambient status display.
  pub fn watch(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  /// Register a listener for transitions from now on.
  ///
  /// Transitions that happened before this call are not replayed.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.events.subscribe()
  }

  /// Feed one observation from the platform signal.
  ///
  /// Repeated reports of the current state are ignored. Returns the event emitted, if any.
  pub fn report(&self, observed: Connectivity) -> Option<ConnectivityEvent> {
    let previous = self.state.send_replace(observed);
    let event = match (previous, observed) {
      (Connectivity::Offline, Connectivity::Online) => ConnectivityEvent::Reconnected,
      (Connectivity::Online, Connectivity::Offline) => ConnectivityEvent::WentOffline,
      _ => return None,
    };

    match event {
      ConnectivityEvent::Reconnected => info!("back online, resyncing"),
      ConnectivityEvent::WentOffline => {
        warn!("offline; changes will sync when the connection returns")
      }
    }

    // No receivers is fine: nobody is listening right now
    let _ = self.events.send(event);
    Some(event)
  }

  /// Drive the monitor from a stream of reachability observations.
  pub fn spawn<S>(self: &Arc<Self>, signal: S) -> JoinHandle<()>
  where
    S: Stream<Item = bool> + Send + 'static,
  {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      futures::pin_mut!(signal);
      while let Some(reachable) = signal.next().await {
        monitor.report(Connectivity::from_reachable(reachable));
      }
    })
  }
}

/// Reachability signal for hosts without a platform online/offline event:
/// attempts a TCP connection to `addr` every `interval`.
pub fn tcp_reachability(addr: SocketAddr, interval: Duration) -> impl Stream<Item = bool> {
  futures::stream::unfold(tokio::time::interval(interval), move |mut ticker| async move {
    ticker.tick().await;
    let reachable = tokio::time::timeout(interval, tokio::net::TcpStream::connect(addr))
      .await
      .map(|result| result.is_ok())
      .unwrap_or(false);
    Some((reachable, ticker))
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::broadcast::error::TryRecvError;

  #[tokio::test]
  async fn test_reconnect_reaches_every_listener_once() {
    let monitor = ConnectivityMonitor::new(Connectivity::Offline);
    let mut a = monitor.subscribe();
    let mut b = monitor.subscribe();

    assert_eq!(monitor.report(Connectivity::Online), Some(ConnectivityEvent::Reconnected));

    assert_eq!(a.try_recv().unwrap(), ConnectivityEvent::Reconnected);
    assert_eq!(b.try_recv().unwrap(), ConnectivityEvent::Reconnected);
    assert!(matches!(a.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(b.try_recv(), Err(TryRecvError::Empty)));
  }

  #[tokio::test]
  async fn test_repeated_online_reports_are_ignored() {
    let monitor = ConnectivityMonitor::new(Connectivity::Offline);
    let mut rx = monitor.subscribe();

    monitor.report(Connectivity::Online);
    assert_eq!(monitor.report(Connectivity::Online), None);

    assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::Reconnected);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
  }

  #[tokio::test]
  async fn test_each_transition_fires_once() {
    let monitor = ConnectivityMonitor::new(Connectivity::Online);
    let mut rx = monitor.subscribe();

    monitor.report(Connectivity::Offline);
    monitor.report(Connectivity::Online);
    monitor.report(Connectivity::Offline);
    monitor.report(Connectivity::Online);

    let mut reconnects = 0;
    while let Ok(event) = rx.try_recv() {
      if event == ConnectivityEvent::Reconnected {
        reconnects += 1;
      }
    }
    assert_eq!(reconnects, 2);
    assert!(monitor.is_online());
  }

  #[tokio::test]
  async fn test_late_listener_misses_earlier_transition() {
    let monitor = ConnectivityMonitor::new(Connectivity::Offline);
    monitor.report(Connectivity::Online);

    let mut late = monitor.subscribe();
    assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
  }

  #[tokio::test]
  async fn test_spawn_consumes_signal() {
    let monitor = Arc::new(ConnectivityMonitor::new(Connectivity::Online));
    let mut rx = monitor.subscribe();

    monitor
      .spawn(futures::stream::iter(vec![true, false, false, true]))
      .await
      .unwrap();

    assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::WentOffline);
    assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::Reconnected);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
  }
}
