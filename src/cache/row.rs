//! Helpers for reading bookkeeping columns off cached rows.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{Location, Row, RowKey};

/// Column recording when a row was last retrieved from the server.
pub const RTIME_FIELD: &str = "rtime";

/// Key of `row` within `location`, if it carries one.
pub fn row_key(location: &Location, row: &Row) -> Option<RowKey> {
  row.get(location.key_field()).and_then(RowKey::from_value)
}

/// Retrieval time of `row`. Missing or unparseable values yield `None`.
pub fn rtime(row: &Row) -> Option<DateTime<Utc>> {
  let value = row.get(RTIME_FIELD)?.as_str()?;
  DateTime::parse_from_rfc3339(value)
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

pub fn stamp_rtime(row: &mut Row, at: DateTime<Utc>) {
  row.insert(RTIME_FIELD.to_string(), Value::String(at.to_rfc3339()));
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use serde_json::json;

  #[test]
  fn test_rtime_round_trip() {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let mut row = Row::new();
    stamp_rtime(&mut row, at);
    assert_eq!(rtime(&row), Some(at));
  }

  #[test]
  fn test_rtime_tolerates_garbage() {
    let mut row = Row::new();
    row.insert(RTIME_FIELD.into(), json!("yesterday"));
    assert_eq!(rtime(&row), None);
    row.insert(RTIME_FIELD.into(), json!(42));
    assert_eq!(rtime(&row), None);
  }

  #[test]
  fn test_row_key_uses_location_key_field() {
    let mut row = Row::new();
    row.insert("id".into(), json!(4));
    row.insert("key".into(), json!("theme"));
    assert_eq!(
      row_key(&Location::new(Some("s"), "global", "user"), &row),
      Some(RowKey::Int(4))
    );
    assert_eq!(
      row_key(&Location::local("settings"), &row),
      Some(RowKey::Text("theme".into()))
    );
  }
}
