//! Search criteria: normalization, row matching and cardinality inference.
//!
//! Criteria map column names to a value or an array of values. The same
//! criteria object filters cached rows and is posted to the server as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Row, RowKey};

/// Criteria keys that shape the result instead of filtering rows.
const CONTROL_FIELDS: &[&str] = &["limit"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Criteria(Map<String, Value>);

impl Criteria {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build criteria from a JSON value. Anything other than an object yields `None`.
  pub fn from_value(value: Value) -> Option<Self> {
    match value {
      Value::Object(map) => Some(Self(map)),
      _ => None,
    }
  }

  pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
    self.0.insert(field.to_string(), value.into());
    self
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn fields(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  pub fn as_map(&self) -> &Map<String, Value> {
    &self.0
  }

  /// Canonical form used for comparison and for the remote request.
  ///
  /// Null fields are removed at every depth and temporary (negative) ids are
  /// dropped from id-like arrays. Applying this twice changes nothing.
  pub fn normalized(&self) -> Criteria {
    let mut map = strip_nulls(&self.0);
    for (field, value) in map.iter_mut() {
      if !is_id_like(field) {
        continue;
      }
      if let Value::Array(items) = value {
        items.retain(|item| !is_temporary_id(item));
      }
    }
    Criteria(map)
  }

  /// Number of values given for `field`: array length, or 1 for a scalar.
  pub fn count(&self, field: &str) -> Option<usize> {
    match self.0.get(field)? {
      Value::Null => None,
      Value::Array(items) => Some(items.len()),
      _ => Some(1),
    }
  }

  /// Keys to look up directly when the criteria consist solely of the key field.
  pub fn key_lookup(&self, key_field: &str) -> Option<Vec<RowKey>> {
    if self.0.len() != 1 {
      return None;
    }
    match self.0.get(key_field)? {
      Value::Array(items) => Some(items.iter().filter_map(RowKey::from_value).collect()),
      value => RowKey::from_value(value).map(|key| vec![key]),
    }
  }

  /// Upper bound on the number of rows to return.
  pub fn limit(&self) -> Option<usize> {
    self
      .0
      .get("limit")
      .and_then(Value::as_u64)
      .map(|n| n as usize)
  }

  /// Whether `row` satisfies every filtering field.
  pub fn matches(&self, row: &Row) -> bool {
    self
      .0
      .iter()
      .filter(|(field, _)| !CONTROL_FIELDS.contains(&field.as_str()))
      .all(|(field, expected)| value_matches(expected, row.get(field)))
  }
}

impl From<Map<String, Value>> for Criteria {
  fn from(map: Map<String, Value>) -> Self {
    Self(map)
  }
}

/// Columns holding row ids: `id`, `ids`, `*_id`, `*_ids`.
pub fn is_id_like(field: &str) -> bool {
  field == "id" || field == "ids" || field.ends_with("_id") || field.ends_with("_ids")
}

fn is_temporary_id(value: &Value) -> bool {
  value.as_i64().map(|id| id < 0).unwrap_or(false)
}

fn strip_nulls(map: &Map<String, Value>) -> Map<String, Value> {
  map
    .iter()
    .filter(|(_, value)| !value.is_null())
    .map(|(field, value)| {
      let value = match value {
        Value::Object(inner) => Value::Object(strip_nulls(inner)),
        other => other.clone(),
      };
      (field.clone(), value)
    })
    .collect()
}

fn value_matches(expected: &Value, actual: Option<&Value>) -> bool {
  let Some(actual) = actual else {
    return expected.is_null();
  };
  match (expected, actual) {
    (Value::Array(wanted), Value::Array(present)) => wanted
      .iter()
      .any(|w| present.iter().any(|p| same_value(w, p))),
    (Value::Array(wanted), value) => wanted.iter().any(|w| same_value(w, value)),
    (Value::Object(wanted), Value::Object(present)) => wanted
      .iter()
      .all(|(field, w)| value_matches(w, present.get(field))),
    (scalar, Value::Array(present)) => present.iter().any(|p| same_value(scalar, p)),
    (scalar, value) => same_value(scalar, value),
  }
}

fn same_value(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
      (Some(x), Some(y)) => x == y,
      _ => x.as_f64() == y.as_f64(),
    },
    _ => a == b,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn criteria(value: Value) -> Criteria {
    Criteria::from_value(value).unwrap()
  }

  fn row(value: Value) -> Row {
    match value {
      Value::Object(map) => map,
      _ => panic!("row must be an object"),
    }
  }

  #[test]
  fn test_normalize_strips_temporary_ids() {
    let c = criteria(json!({ "user_ids": [-3, 7] })).normalized();
    assert_eq!(c, criteria(json!({ "user_ids": [7] })));
  }

  #[test]
  fn test_normalize_removes_nulls_at_depth() {
    let c = criteria(json!({
      "story_id": 4,
      "deleted": null,
      "filters": { "tags": ["x"], "author": null }
    }))
    .normalized();
    assert_eq!(
      c,
      criteria(json!({ "story_id": 4, "filters": { "tags": ["x"] } }))
    );
  }

  #[test]
  fn test_normalize_is_idempotent() {
    let c = criteria(json!({
      "id": [-1, 2, -5, 3],
      "role_ids": [-9],
      "name": null,
      "nested": { "a": null, "b": { "c": null, "d": 1 } },
      "scores": [-1, -2]
    }));
    let once = c.normalized();
    let twice = once.normalized();
    assert_eq!(once, twice);
    // Non id-like arrays keep their negative numbers
    assert_eq!(once.get("scores"), Some(&json!([-1, -2])));
    assert_eq!(once.get("role_ids"), Some(&json!([])));
  }

  #[test]
  fn test_count_and_key_lookup() {
    let c = criteria(json!({ "id": [2, 99] }));
    assert_eq!(c.count("id"), Some(2));
    assert_eq!(c.count("name"), None);
    assert_eq!(c.key_lookup("id"), Some(vec![RowKey::Int(2), RowKey::Int(99)]));

    let single = criteria(json!({ "id": 5 }));
    assert_eq!(single.count("id"), Some(1));
    assert_eq!(single.key_lookup("id"), Some(vec![RowKey::Int(5)]));

    let broader = criteria(json!({ "id": 5, "deleted": false }));
    assert_eq!(broader.key_lookup("id"), None);
  }

  #[test]
  fn test_matches_scalars_and_arrays() {
    let r = row(json!({ "id": 3, "type": "post", "user_ids": [1, 7], "deleted": false }));

    assert!(criteria(json!({ "type": "post" })).matches(&r));
    assert!(criteria(json!({ "type": ["story", "post"] })).matches(&r));
    assert!(criteria(json!({ "user_ids": [7] })).matches(&r));
    assert!(criteria(json!({ "user_ids": 1 })).matches(&r));
    assert!(!criteria(json!({ "user_ids": [2, 3] })).matches(&r));
    assert!(!criteria(json!({ "type": "story" })).matches(&r));
    assert!(!criteria(json!({ "missing": 1 })).matches(&r));
    assert!(criteria(json!({ "deleted": false, "limit": 1 })).matches(&r));
  }

  #[test]
  fn test_matches_nested_objects() {
    let r = row(json!({ "details": { "lang": "en", "rank": 2 } }));
    assert!(criteria(json!({ "details": { "lang": "en" } })).matches(&r));
    assert!(!criteria(json!({ "details": { "lang": "fr" } })).matches(&r));
  }

  #[test]
  fn test_numbers_compare_by_value() {
    let r = row(json!({ "rank": 2.0 }));
    assert!(criteria(json!({ "rank": 2 })).matches(&r));
  }

  #[test]
  fn test_limit() {
    assert_eq!(criteria(json!({ "limit": 10 })).limit(), Some(10));
    assert_eq!(criteria(json!({})).limit(), None);
  }
}
