use tokio::sync::mpsc;

/// Why an external party asked for a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
  /// Connectivity came back
  Reconnect,
  /// A scheduled job, message or other integration
  External(String),
}

/// Online/offline transitions reported by the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online,
  Offline,
}

/// Events consumed by the refresh scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Refresh everything now, best effort
  Wake(WakeReason),
  /// Connectivity changed
  Connectivity(ConnectivityEvent),
}

/// Cloneable handle used by integrations to poke the scheduler.
#[derive(Debug, Clone)]
pub struct WakeSignal {
  tx: mpsc::UnboundedSender<Event>,
}

impl WakeSignal {
  /// Request a refresh of all sources. Returns `false` once the scheduler is gone.
  pub fn wake(&self, reason: WakeReason) -> bool {
    self.tx.send(Event::Wake(reason)).is_ok()
  }

  /// Report a connectivity transition. Going online also triggers a refresh.
  pub fn connectivity(&self, event: ConnectivityEvent) -> bool {
    self.tx.send(Event::Connectivity(event)).is_ok()
  }
}

/// Receiving end of the event channel, owned by the scheduler
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// A new handle for sending events
  pub fn sender(&self) -> WakeSignal {
    WakeSignal {
      tx: self.tx.clone(),
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_events_are_delivered_in_order() {
    let mut handler = EventHandler::new();
    let signal = handler.sender();

    assert!(signal.connectivity(ConnectivityEvent::Offline));
    assert!(signal.wake(WakeReason::External("cron".into())));

    assert_eq!(
      handler.next().await,
      Some(Event::Connectivity(ConnectivityEvent::Offline))
    );
    assert_eq!(
      handler.next().await,
      Some(Event::Wake(WakeReason::External("cron".into())))
    );
  }

  #[test]
  fn test_send_fails_after_handler_dropped() {
    let signal = EventHandler::new().sender();
    assert!(!signal.wake(WakeReason::Reconnect));
  }
}
