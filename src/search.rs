//! The Search model: one deduplicated query and the state of its results.
//!
//! A Search decides whether a cached answer is good enough:
//! - `is_fresh` trusts the last validation for a while, unless a change
//!   notification has marked the Search dirty
//! - `is_sufficiently_recent` anchors freshness to the oldest cached row
//! - `is_sufficiently_cached` decides whether cached rows may be shown while
//!   a refresh runs

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::row::{row_key, rtime};
use crate::criteria::Criteria;
use crate::types::{ChangeEvent, Location, Query, Row, RowKey, SearchOptions};

#[derive(Debug, Clone)]
pub struct Search {
  location: Location,
  criteria: Criteria,
  options: SearchOptions,
  signature: String,
  results: Option<Vec<Row>>,
  dirty: bool,
  last_retrieved: Option<DateTime<Utc>>,
  finish: Option<DateTime<Utc>>,
}

/// Canonical form hashed into the signature.
#[derive(Serialize)]
struct SignatureInput<'a> {
  location: &'a Location,
  criteria: &'a Criteria,
  options: &'a SearchOptions,
}

impl Search {
  /// Create a Search with normalized criteria and an inferred `expected` count.
  pub fn new(location: Location, criteria: &Criteria, mut options: SearchOptions) -> Self {
    let criteria = criteria.normalized();
    if options.expected.is_none() {
      options.expected = criteria
        .count("id")
        .or_else(|| criteria.count("name"))
        .or_else(|| criteria.count("filters"));
    }
    let signature = compute_signature(&location, &criteria, &options);

    Self {
      location,
      criteria,
      options,
      signature,
      results: None,
      dirty: false,
      last_retrieved: None,
      finish: None,
    }
  }

  pub fn from_query(query: &Query) -> Self {
    Self::new(query.location(), &query.criteria, query.options.clone())
  }

  pub fn location(&self) -> &Location {
    &self.location
  }

  pub fn criteria(&self) -> &Criteria {
    &self.criteria
  }

  pub fn options(&self) -> &SearchOptions {
    &self.options
  }

  /// Stable hash of location, criteria and options.
  pub fn signature(&self) -> &str {
    &self.signature
  }

  pub fn results(&self) -> Option<&[Row]> {
    self.results.as_deref()
  }

  pub fn result_count(&self) -> usize {
    self.results.as_ref().map(Vec::len).unwrap_or(0)
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  pub fn last_retrieved(&self) -> Option<DateTime<Utc>> {
    self.last_retrieved
  }

  pub fn finish(&self) -> Option<DateTime<Utc>> {
    self.finish
  }

  /// Whether `other` is the same logical query.
  pub fn matches(&self, other: &Search) -> bool {
    self.location == other.location
      && self.criteria == other.criteria
      && self.options == other.options
  }

  /// Whether every cached row was retrieved recently enough to skip a refresh.
  ///
  /// Rows retrieved before `session_start` never qualify: nothing was
  /// listening for changes to them in the meantime. On success `finish` is
  /// moved to the oldest retrieval time.
  pub fn is_sufficiently_recent(
    &mut self,
    refresh_interval: Duration,
    session_start: DateTime<Utc>,
  ) -> bool {
    if self.location.is_local() {
      return true;
    }
    let Some(rows) = self.results.as_ref().filter(|rows| !rows.is_empty()) else {
      return false;
    };

    let mut oldest: Option<DateTime<Utc>> = None;
    for row in rows {
      let Some(retrieved) = rtime(row) else {
        return false;
      };
      oldest = Some(oldest.map_or(retrieved, |o| o.min(retrieved)));
    }
    let Some(oldest) = oldest else {
      return false;
    };

    if oldest < session_start {
      return false;
    }
    if Utc::now() - oldest < refresh_interval {
      self.finish = Some(oldest);
      true
    } else {
      false
    }
  }

  /// Whether the results can be trusted without asking the server.
  pub fn is_fresh(&self, refresh_interval: Duration) -> bool {
    if self.location.is_local() {
      return true;
    }
    if self.dirty {
      return false;
    }
    self
      .finish
      .map(|finish| Utc::now() - finish < refresh_interval)
      .unwrap_or(false)
  }

  /// Whether the cached results may be shown while a refresh proceeds.
  ///
  /// The threshold is `minimum`, else `expected`, else one row.
  pub fn is_sufficiently_cached(&self) -> bool {
    let Some(rows) = &self.results else {
      return false;
    };
    let wanted = self.options.minimum.or(self.options.expected).unwrap_or(1);
    rows.len() >= wanted
  }

  /// Whether the result count equals the expected count.
  pub fn is_meeting_expectation(&self) -> bool {
    match self.options.expected {
      Some(expected) => self.result_count() == expected,
      None => false,
    }
  }

  pub fn mark_dirty(&mut self) {
    self.dirty = true;
  }

  /// Adopt rows read from the local cache.
  pub fn set_cached_results(&mut self, rows: Vec<Row>) {
    self.results = Some(self.visible(rows));
  }

  /// A replacement Search carrying rows just retrieved from the server.
  pub fn refreshed(&self, rows: Vec<Row>, at: DateTime<Utc>) -> Search {
    Search {
      results: Some(self.visible(rows)),
      dirty: false,
      last_retrieved: Some(at),
      finish: Some(at),
      ..self.clone()
    }
  }

  /// Apply a local write to the result set.
  ///
  /// Saved rows that satisfy the criteria are upserted, ones that no longer
  /// do are dropped. Returns whether the results changed.
  pub fn apply_saved(&mut self, saved: &[Row]) -> bool {
    let location = self.location.clone();
    let committed = self.options.committed;
    let criteria = self.criteria.clone();
    let Some(results) = self.results.as_mut() else {
      return false;
    };

    let mut changed = false;
    for row in saved {
      let Some(key) = row_key(&location, row) else {
        continue;
      };
      let existing = results
        .iter()
        .position(|r| row_key(&location, r).as_ref() == Some(&key));
      let wanted = criteria.matches(row) && !(committed && key.is_temporary());
      match (existing, wanted) {
        (Some(index), true) => results[index] = row.clone(),
        (Some(index), false) => {
          results.remove(index);
        }
        (None, true) => results.push(row.clone()),
        (None, false) => continue,
      }
      changed = true;
    }
    changed
  }

  /// Drop rows with the given keys from the result set.
  pub fn apply_removed(&mut self, keys: &[RowKey]) -> bool {
    let location = self.location.clone();
    let Some(results) = self.results.as_mut() else {
      return false;
    };
    let before = results.len();
    results.retain(|row| {
      row_key(&location, row)
        .map(|key| !keys.contains(&key))
        .unwrap_or(true)
    });
    results.len() != before
  }

  /// Whether a change to a row could alter this Search's results.
  ///
  /// Rows already in the results always count. Otherwise an `id` criterion
  /// must name the row, or the change must touch one of the filtered columns.
  pub fn could_include(&self, change: &ChangeEvent) -> bool {
    if change.schema != self.location.schema || change.table != self.location.table {
      return false;
    }
    let key = RowKey::Int(change.id);
    let in_results = self
      .results
      .iter()
      .flatten()
      .any(|row| row_key(&self.location, row).as_ref() == Some(&key));
    if in_results {
      return true;
    }
    if let Some(ids) = self.criteria.get("id") {
      let wanted = serde_json::Value::from(change.id);
      return match ids {
        serde_json::Value::Array(ids) => ids.contains(&wanted),
        id => *id == wanted,
      };
    }
    let mut filtered = self.criteria.fields().filter(|f| *f != "limit").peekable();
    if filtered.peek().is_none() {
      return true;
    }
    filtered.any(|field| change.touches(field))
  }

  fn visible(&self, rows: Vec<Row>) -> Vec<Row> {
    if !self.options.committed {
      return rows;
    }
    rows
      .into_iter()
      .filter(|row| {
        row_key(&self.location, row)
          .map(|key| !key.is_temporary())
          .unwrap_or(true)
      })
      .collect()
  }
}

fn compute_signature(location: &Location, criteria: &Criteria, options: &SearchOptions) -> String {
  let input = SignatureInput {
    location,
    criteria,
    options,
  };
  // Map keys serialize in sorted order, so equal queries hash equally
  let canonical = serde_json::to_string(&input).unwrap_or_default();

  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::row::stamp_rtime;
  use serde_json::{json, Value};

  fn criteria(value: Value) -> Criteria {
    Criteria::from_value(value).unwrap()
  }

  fn row(value: Value) -> Row {
    match value {
      Value::Object(map) => map,
      _ => panic!("row must be an object"),
    }
  }

  fn users() -> Location {
    Location::new(Some("example.net"), "global", "user")
  }

  fn search(value: Value) -> Search {
    Search::new(users(), &criteria(value), SearchOptions::default())
  }

  fn rows_retrieved_at(at: DateTime<Utc>, ids: &[i64]) -> Vec<Row> {
    ids
      .iter()
      .map(|id| {
        let mut r = row(json!({ "id": id }));
        stamp_rtime(&mut r, at);
        r
      })
      .collect()
  }

  #[test]
  fn test_identical_queries_match() {
    let a = search(json!({ "user_ids": [-3, 7], "deleted": false, "extra": null }));
    let b = search(json!({ "deleted": false, "user_ids": [7] }));
    assert!(a.matches(&b));
    assert_eq!(a.signature(), b.signature());
  }

  #[test]
  fn test_options_distinguish_queries() {
    let plain = search(json!({ "id": 1 }));
    let remote = Search::new(
      users(),
      &criteria(json!({ "id": 1 })),
      SearchOptions {
        remote: true,
        ..Default::default()
      },
    );
    assert!(!plain.matches(&remote));
    assert_ne!(plain.signature(), remote.signature());

    let elsewhere = Search::new(
      Location::new(Some("other.net"), "global", "user"),
      &criteria(json!({ "id": 1 })),
      SearchOptions::default(),
    );
    assert!(!plain.matches(&elsewhere));
  }

  #[test]
  fn test_expected_is_inferred_in_priority_order() {
    assert_eq!(search(json!({ "id": [1, 2, 3] })).options().expected, Some(3));
    assert_eq!(
      search(json!({ "name": ["a", "b"], "filters": [1] })).options().expected,
      Some(2)
    );
    assert_eq!(search(json!({ "filters": [1] })).options().expected, Some(1));
    assert_eq!(search(json!({ "type": "post" })).options().expected, None);

    let explicit = Search::new(
      users(),
      &criteria(json!({ "id": [1, 2, 3] })),
      SearchOptions {
        expected: Some(10),
        ..Default::default()
      },
    );
    assert_eq!(explicit.options().expected, Some(10));
  }

  #[test]
  fn test_dirty_overrides_freshness() {
    let s = search(json!({ "id": 1 }));
    let mut s = s.refreshed(rows_retrieved_at(Utc::now(), &[1]), Utc::now());
    assert!(s.is_fresh(Duration::minutes(5)));
    assert!(!s.is_dirty());

    s.mark_dirty();
    assert!(!s.is_fresh(Duration::minutes(5)));
    assert!(!s.is_fresh(Duration::days(365)));

    // A refresh clears dirtiness; a later notification sets it again
    let mut s = s.refreshed(rows_retrieved_at(Utc::now(), &[1]), Utc::now());
    assert!(s.is_fresh(Duration::minutes(5)));
    s.mark_dirty();
    assert!(!s.is_fresh(Duration::minutes(5)));
  }

  #[test]
  fn test_freshness_expires() {
    let at = Utc::now() - Duration::minutes(10);
    let s = search(json!({ "id": 1 })).refreshed(rows_retrieved_at(at, &[1]), at);
    assert!(!s.is_fresh(Duration::minutes(5)));
    assert!(s.is_fresh(Duration::minutes(15)));
  }

  #[test]
  fn test_local_schema_is_always_fresh() {
    let mut s = Search::new(
      Location::local("settings"),
      &criteria(json!({ "key": "theme" })),
      SearchOptions::default(),
    );
    s.mark_dirty();
    assert!(s.is_fresh(Duration::zero()));
    assert!(s.is_sufficiently_recent(Duration::zero(), Utc::now()));
  }

  #[test]
  fn test_session_boundary_staleness() {
    let session_start = Utc::now() - Duration::minutes(1);
    let before_session = session_start - Duration::seconds(1);
    let mut s = search(json!({ "id": [1, 2] }));
    s.set_cached_results(rows_retrieved_at(before_session, &[1, 2]));
    assert!(!s.is_sufficiently_recent(Duration::days(365), session_start));
    assert_eq!(s.finish(), None);
  }

  #[test]
  fn test_recent_rows_anchor_finish_to_oldest() {
    let session_start = Utc::now() - Duration::hours(1);
    let older = Utc::now() - Duration::minutes(3);
    let newer = Utc::now() - Duration::minutes(1);
    let mut rows = rows_retrieved_at(newer, &[1]);
    rows.extend(rows_retrieved_at(older, &[2]));

    let mut s = search(json!({ "id": [1, 2] }));
    s.set_cached_results(rows);
    assert!(s.is_sufficiently_recent(Duration::minutes(5), session_start));
    assert_eq!(s.finish().map(|f| f.timestamp()), Some(older.timestamp()));
    assert!(s.is_fresh(Duration::minutes(5)));

    assert!(!s.is_sufficiently_recent(Duration::minutes(2), session_start));
  }

  #[test]
  fn test_rows_without_rtime_are_not_recent() {
    let mut s = search(json!({ "id": 1 }));
    s.set_cached_results(vec![row(json!({ "id": 1 }))]);
    assert!(!s.is_sufficiently_recent(Duration::days(1), Utc::now() - Duration::days(1)));

    let mut empty = search(json!({ "id": 1 }));
    empty.set_cached_results(Vec::new());
    assert!(!empty.is_sufficiently_recent(Duration::days(1), Utc::now() - Duration::days(1)));
  }

  #[test]
  fn test_sufficiently_cached_thresholds() {
    let mut by_expected = search(json!({ "id": [1, 2, 3] }));
    assert!(!by_expected.is_sufficiently_cached());
    by_expected.set_cached_results(vec![row(json!({"id": 1})), row(json!({"id": 2}))]);
    assert!(!by_expected.is_sufficiently_cached());
    assert!(!by_expected.is_meeting_expectation());

    let mut by_minimum = Search::new(
      users(),
      &criteria(json!({ "id": [1, 2, 3] })),
      SearchOptions {
        minimum: Some(2),
        ..Default::default()
      },
    );
    by_minimum.set_cached_results(vec![row(json!({"id": 1})), row(json!({"id": 2}))]);
    assert!(by_minimum.is_sufficiently_cached());
    assert!(!by_minimum.is_meeting_expectation());

    let mut by_default = search(json!({ "type": "post" }));
    by_default.set_cached_results(Vec::new());
    assert!(!by_default.is_sufficiently_cached());
    by_default.set_cached_results(vec![row(json!({"id": 4}))]);
    assert!(by_default.is_sufficiently_cached());
    assert!(!by_default.is_meeting_expectation());
  }

  #[test]
  fn test_committed_hides_temporary_rows() {
    let mut s = Search::new(
      users(),
      &Criteria::new(),
      SearchOptions {
        committed: true,
        ..Default::default()
      },
    );
    s.set_cached_results(vec![row(json!({"id": -1})), row(json!({"id": 2}))]);
    assert_eq!(s.result_count(), 1);

    assert!(!s.apply_saved(&[row(json!({"id": -2}))]));
    assert_eq!(s.result_count(), 1);
  }

  #[test]
  fn test_apply_saved_and_removed() {
    let mut s = search(json!({ "type": "admin" }));
    s.set_cached_results(vec![row(json!({"id": 1, "type": "admin"}))]);

    assert!(s.apply_saved(&[row(json!({"id": 2, "type": "admin"}))]));
    assert_eq!(s.result_count(), 2);

    // No longer matching: dropped
    assert!(s.apply_saved(&[row(json!({"id": 1, "type": "member"}))]));
    assert_eq!(s.result_count(), 1);

    // Irrelevant row: untouched
    assert!(!s.apply_saved(&[row(json!({"id": 9, "type": "member"}))]));

    assert!(s.apply_removed(&[RowKey::Int(2)]));
    assert_eq!(s.result_count(), 0);
    assert!(!s.apply_removed(&[RowKey::Int(2)]));
  }

  #[test]
  fn test_could_include() {
    let change = |id: i64, diff: Option<Value>| ChangeEvent {
      schema: "global".into(),
      table: "user".into(),
      id,
      diff: diff.map(|d| match d {
        Value::Object(map) => map,
        _ => panic!("diff must be an object"),
      }),
    };

    let by_id = search(json!({ "id": [1, 2] }));
    assert!(by_id.could_include(&change(2, None)));
    assert!(!by_id.could_include(&change(3, None)));

    let mut by_type = search(json!({ "type": "admin" }));
    by_type.set_cached_results(vec![row(json!({"id": 5, "type": "admin"}))]);
    assert!(by_type.could_include(&change(5, Some(json!({ "name": ["a", "b"] })))));
    assert!(by_type.could_include(&change(6, Some(json!({ "type": ["member", "admin"] })))));
    assert!(!by_type.could_include(&change(6, Some(json!({ "name": ["a", "b"] })))));
    assert!(by_type.could_include(&change(6, None)));

    let everything = search(json!({}));
    assert!(everything.could_include(&change(42, Some(json!({ "name": ["a", "b"] })))));

    let other_table = ChangeEvent {
      table: "story".into(),
      ..change(1, None)
    };
    assert!(!by_id.could_include(&other_table));
  }
}
