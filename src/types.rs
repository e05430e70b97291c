//! Shapes exchanged between the sync layer and its collaborators.
//!
//! Queries come in from finder code, change notifications arrive over the
//! push channel, and rows flow back out as plain JSON objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::criteria::Criteria;

/// Schema whose rows live purely on the client (settings, session data).
pub const LOCAL_SCHEMA: &str = "local";

/// Server placeholder used when a query names no server.
pub const LOCAL_SERVER: &str = "localhost";

/// A cached or retrieved record: its original columns plus `rtime`.
pub type Row = serde_json::Map<String, Value>;

// ============================================================================
// Locations and queries
// ============================================================================

/// A logical row collection: `(server, schema, table)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
  pub server: String,
  pub schema: String,
  pub table: String,
}

impl Location {
  /// Local-schema locations always live on `LOCAL_SERVER`.
  pub fn new(server: Option<&str>, schema: &str, table: &str) -> Self {
    let server = match server {
      Some(server) if schema != LOCAL_SCHEMA => server,
      _ => LOCAL_SERVER,
    };
    Self {
      server: server.to_string(),
      schema: schema.to_string(),
      table: table.to_string(),
    }
  }

  /// Location in the client-only schema.
  pub fn local(table: &str) -> Self {
    Self::new(None, LOCAL_SCHEMA, table)
  }

  pub fn is_local(&self) -> bool {
    self.schema == LOCAL_SCHEMA
  }

  /// Name of the column that keys rows in this location.
  pub fn key_field(&self) -> &'static str {
    if self.is_local() {
      "key"
    } else {
      "id"
    }
  }
}

impl fmt::Display for Location {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.server, self.schema, self.table)
  }
}

/// Options that, together with location and criteria, identify a Search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchOptions {
  /// Minimum acceptable number of cached results
  #[serde(default)]
  pub minimum: Option<usize>,
  /// Expected number of results, inferred from criteria when absent
  #[serde(default)]
  pub expected: Option<usize>,
  /// Always go to the server
  #[serde(default)]
  pub remote: bool,
  /// Only return rows the server has confirmed
  #[serde(default)]
  pub committed: bool,
  /// Fail instead of returning partial results
  #[serde(default)]
  pub required: bool,
}

/// A query as issued by finder code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
  #[serde(default)]
  pub server: Option<String>,
  pub schema: String,
  pub table: String,
  #[serde(default)]
  pub criteria: Criteria,
  #[serde(flatten)]
  pub options: SearchOptions,
}

impl Query {
  pub fn new(schema: &str, table: &str, criteria: Criteria) -> Self {
    Self {
      server: None,
      schema: schema.to_string(),
      table: table.to_string(),
      criteria,
      options: SearchOptions::default(),
    }
  }

  pub fn on_server(mut self, server: &str) -> Self {
    self.server = Some(server.to_string());
    self
  }

  pub fn with_options(mut self, options: SearchOptions) -> Self {
    self.options = options;
    self
  }

  pub fn location(&self) -> Location {
    Location::new(self.server.as_deref(), &self.schema, &self.table)
  }
}

// ============================================================================
// Row keys
// ============================================================================

/// Sort key of a cached row: numeric `id` for remote schemas, string `key`
/// for the local schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
  Int(i64),
  Text(String),
}

impl RowKey {
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::Number(n) => n.as_i64().map(RowKey::Int),
      Value::String(s) => Some(RowKey::Text(s.clone())),
      _ => None,
    }
  }

  /// Negative ids are assigned to rows the server has not seen yet.
  pub fn is_temporary(&self) -> bool {
    matches!(self, RowKey::Int(id) if *id < 0)
  }
}

impl Ord for RowKey {
  fn cmp(&self, other: &Self) -> Ordering {
    match (self, other) {
      (RowKey::Int(a), RowKey::Int(b)) => a.cmp(b),
      (RowKey::Text(a), RowKey::Text(b)) => a.cmp(b),
      (RowKey::Int(_), RowKey::Text(_)) => Ordering::Less,
      (RowKey::Text(_), RowKey::Int(_)) => Ordering::Greater,
    }
  }
}

impl PartialOrd for RowKey {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl fmt::Display for RowKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RowKey::Int(id) => write!(f, "{}", id),
      RowKey::Text(key) => write!(f, "{}", key),
    }
  }
}

// ============================================================================
// Push channel messages
// ============================================================================

/// One changed row reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub schema: String,
  pub table: String,
  pub id: i64,
  /// Changed column name -> `[old, new]`
  #[serde(default)]
  pub diff: Option<serde_json::Map<String, Value>>,
}

impl ChangeEvent {
  /// Whether the change touches the named column.
  pub fn touches(&self, field: &str) -> bool {
    self
      .diff
      .as_ref()
      .map(|diff| diff.contains_key(field))
      .unwrap_or(true)
  }
}

/// Out-of-band user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub schema: Option<String>,
  #[serde(default)]
  pub notification_id: Option<i64>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, Value>,
}

/// A message arriving over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMessage {
  Changes(Vec<ChangeEvent>),
  Alert(Alert),
  /// Connection handshake carrying the subscription token
  Socket(String),
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_location_defaults_to_local_server() {
    let location = Location::new(None, "local", "settings");
    assert_eq!(location.server, LOCAL_SERVER);
    assert_eq!(location.key_field(), "key");

    let pinned = Location::new(Some("example.net"), "local", "settings");
    assert_eq!(pinned, location);

    let remote = Location::new(Some("example.net"), "global", "user");
    assert_eq!(remote.key_field(), "id");
    assert_eq!(remote.to_string(), "example.net/global/user");
  }

  #[test]
  fn test_row_key_ordering() {
    let mut keys = vec![
      RowKey::Text("b".into()),
      RowKey::Int(3),
      RowKey::Int(-1),
      RowKey::Text("a".into()),
    ];
    keys.sort();
    assert_eq!(
      keys,
      vec![
        RowKey::Int(-1),
        RowKey::Int(3),
        RowKey::Text("a".into()),
        RowKey::Text("b".into()),
      ]
    );
    assert!(RowKey::Int(-1).is_temporary());
    assert!(!RowKey::Int(0).is_temporary());
  }

  #[test]
  fn test_notification_message_shapes() {
    let changes: NotificationMessage = serde_json::from_value(json!({
      "changes": [{ "schema": "global", "table": "user", "id": 5, "diff": { "name": ["a", "b"] } }]
    }))
    .unwrap();
    match changes {
      NotificationMessage::Changes(list) => {
        assert_eq!(list.len(), 1);
        assert!(list[0].touches("name"));
        assert!(!list[0].touches("email"));
      }
      other => panic!("unexpected message {:?}", other),
    }

    let socket: NotificationMessage = serde_json::from_value(json!({ "socket": "abc" })).unwrap();
    assert_eq!(socket, NotificationMessage::Socket("abc".into()));

    let alert: NotificationMessage =
      serde_json::from_value(json!({ "alert": { "title": "Hi", "message": "there" } })).unwrap();
    assert!(matches!(alert, NotificationMessage::Alert(a) if a.title.as_deref() == Some("Hi")));
  }

  #[test]
  fn test_change_without_diff_touches_everything() {
    let change = ChangeEvent {
      schema: "global".into(),
      table: "user".into(),
      id: 1,
      diff: None,
    };
    assert!(change.touches("anything"));
  }

  #[test]
  fn test_query_flattens_options() {
    let query: Query = serde_json::from_value(json!({
      "schema": "global",
      "table": "user",
      "criteria": { "id": [1, 2] },
      "minimum": 1,
      "required": true
    }))
    .unwrap();
    assert_eq!(query.options.minimum, Some(1));
    assert!(query.options.required);
    assert!(!query.options.remote);
    assert_eq!(query.location().server, LOCAL_SERVER);
  }
}
