use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{Alert, Location};

/// Events the data source emits for observers to re-render or report on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSourceEvent {
  /// Results at a location changed
  Change { location: Location },
  /// Change notifications invalidated this many Searches
  Dirty { server: String, searches: usize },
  /// User-facing notification pushed by the server
  Alert { server: String, alert: Alert },
  /// A background refresh failed; cached results were kept
  FetchFailed { location: Location, message: String },
  /// The push channel to a server went up or down
  Connection { server: String, connected: bool },
}

/// Broadcasts events to every subscriber in emission order.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<DataSourceEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<DataSourceEvent> {
    self.tx.subscribe()
  }

  /// Send an event. Having no subscribers is not an error.
  pub fn emit(&self, event: DataSourceEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_events_arrive_in_order() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();

    bus.emit(DataSourceEvent::Connection {
      server: "a".into(),
      connected: true,
    });
    bus.emit(DataSourceEvent::Dirty {
      server: "a".into(),
      searches: 2,
    });

    assert!(matches!(
      rx.recv().await.unwrap(),
      DataSourceEvent::Connection { connected: true, .. }
    ));
    assert!(matches!(
      rx.recv().await.unwrap(),
      DataSourceEvent::Dirty { searches: 2, .. }
    ));
  }

  #[test]
  fn test_event_serializes_with_type_tag() {
    let event = DataSourceEvent::Connection {
      server: "a".into(),
      connected: false,
    };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      serde_json::json!({ "type": "connection", "server": "a", "connected": false })
    );
  }

  #[test]
  fn test_emit_without_subscribers() {
    let bus = EventBus::default();
    bus.emit(DataSourceEvent::Change {
      location: Location::local("settings"),
    });
  }
}
