//! Key-ordered store of previously retrieved rows.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::row::{row_key, rtime};
use super::storage::PersistentStore;
use crate::criteria::Criteria;
use crate::types::{Location, Row, RowKey, LOCAL_SCHEMA};

/// Eviction policy for remote rows. The modes are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanCriteria {
  /// Drop every row retrieved from the named server
  Server(String),
  /// Keep only this many rows, dropping the least recently retrieved first
  Count(usize),
  /// Drop rows retrieved before the cutoff
  Before(DateTime<Utc>),
}

/// Per-location row arrays, each sorted by key.
///
/// Rows in the `local` schema are written to the persistent store after
/// every change. Remote rows stay in memory since the server can always
/// supply them again.
pub struct LocalCache<S: PersistentStore> {
  store: S,
  database: String,
  tables: BTreeMap<Location, Vec<Row>>,
}

impl<S: PersistentStore> LocalCache<S> {
  /// Open the cache, restoring local-schema rows saved under `database`.
  ///
  /// A missing or unreadable blob yields an empty cache.
  pub fn open(store: S, database: &str) -> Self {
    let mut cache = Self {
      store,
      database: database.to_string(),
      tables: BTreeMap::new(),
    };
    cache.restore();
    cache
  }

  fn restore(&mut self) {
    let blob = match self.store.load(&self.database) {
      Ok(Some(blob)) => blob,
      Ok(None) => return,
      Err(e) => {
        warn!("Ignoring unreadable cache {}: {}", self.database, e);
        return;
      }
    };

    let saved: BTreeMap<String, Vec<Row>> = match serde_json::from_str(&blob) {
      Ok(saved) => saved,
      Err(e) => {
        warn!("Ignoring malformed cache {}: {}", self.database, e);
        return;
      }
    };

    for (table, rows) in saved {
      let location = Location::local(&table);
      let mut keyed: Vec<(RowKey, Row)> = rows
        .into_iter()
        .filter_map(|row| row_key(&location, &row).map(|key| (key, row)))
        .collect();
      keyed.sort_by(|a, b| a.0.cmp(&b.0));
      keyed.dedup_by(|a, b| a.0 == b.0);
      self
        .tables
        .insert(location, keyed.into_iter().map(|(_, row)| row).collect());
    }
  }

  /// Rows at `location` satisfying `criteria`.
  ///
  /// Criteria naming only the key field are answered by binary search, in the
  /// order the keys were given. Missing keys are skipped.
  pub fn find(&self, location: &Location, criteria: &Criteria) -> Vec<Row> {
    let Some(rows) = self.tables.get(location) else {
      return Vec::new();
    };
    let criteria = criteria.normalized();

    if let Some(keys) = criteria.key_lookup(location.key_field()) {
      return keys
        .iter()
        .filter_map(|key| {
          position(location, rows, key)
            .ok()
            .map(|index| rows[index].clone())
        })
        .collect();
    }

    let matching = rows.iter().filter(|row| criteria.matches(row)).cloned();
    match criteria.limit() {
      Some(limit) => matching.take(limit).collect(),
      None => matching.collect(),
    }
  }

  /// Upsert `objects` by key. Rows without a key are skipped.
  pub fn save(&mut self, location: &Location, objects: &[Row]) -> Result<Vec<Row>> {
    let rows = self.tables.entry(location.clone()).or_default();
    let mut saved = Vec::with_capacity(objects.len());

    for object in objects {
      let Some(key) = row_key(location, object) else {
        warn!("Not caching row without {} in {}", location.key_field(), location);
        continue;
      };
      match position(location, rows, &key) {
        Ok(index) => rows[index] = object.clone(),
        Err(index) => rows.insert(index, object.clone()),
      }
      saved.push(object.clone());
    }

    if location.is_local() {
      self.persist()?;
    }
    Ok(saved)
  }

  /// Delete `objects` by key. Keys not present are ignored.
  pub fn remove(&mut self, location: &Location, objects: &[Row]) -> Result<Vec<Row>> {
    let mut removed = Vec::new();
    if let Some(rows) = self.tables.get_mut(location) {
      for object in objects {
        let Some(key) = row_key(location, object) else {
          continue;
        };
        if let Ok(index) = position(location, rows, &key) {
          removed.push(rows.remove(index));
        }
      }
    }

    if location.is_local() {
      self.persist()?;
    }
    Ok(removed)
  }

  /// Evict remote rows. Returns how many rows were dropped.
  ///
  /// `Count` orders rows by retrieval time, oldest first. Rows with equal
  /// times keep location-then-key order, and rows without a time count as
  /// oldest.
  pub fn clean(&mut self, criteria: &CleanCriteria) -> usize {
    let removed = match criteria {
      CleanCriteria::Server(server) => {
        let doomed: Vec<Location> = self
          .remote_locations()
          .filter(|location| &location.server == server)
          .cloned()
          .collect();
        doomed
          .iter()
          .filter_map(|location| self.tables.remove(location))
          .map(|rows| rows.len())
          .sum()
      }
      CleanCriteria::Count(keep) => {
        let mut candidates: Vec<(Option<DateTime<Utc>>, Location, RowKey)> = Vec::new();
        for (location, rows) in self.tables.iter().filter(|(l, _)| !l.is_local()) {
          for row in rows {
            if let Some(key) = row_key(location, row) {
              candidates.push((rtime(row), location.clone(), key));
            }
          }
        }
        if candidates.len() <= *keep {
          return 0;
        }
        let excess = candidates.len() - keep;
        // Stable sort keeps the location/key order for equal times
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        let doomed: HashSet<(Location, RowKey)> = candidates
          .into_iter()
          .take(excess)
          .map(|(_, location, key)| (location, key))
          .collect();
        self.retain_remote(|location, key, _| !doomed.contains(&(location.clone(), key.clone())))
      }
      CleanCriteria::Before(cutoff) => {
        self.retain_remote(|_, _, row| rtime(row).map(|t| t >= *cutoff).unwrap_or(false))
      }
    };

    self.tables.retain(|_, rows| !rows.is_empty());
    debug!("Evicted {} cached rows ({:?})", removed, criteria);
    removed
  }

  /// Clear remote rows, optionally only those of one server and/or schema.
  pub fn reset(&mut self, server: Option<&str>, schema: Option<&str>) {
    self.tables.retain(|location, _| {
      if location.is_local() {
        return true;
      }
      let server_matches = server.map(|s| location.server == s).unwrap_or(true);
      let schema_matches = schema.map(|s| location.schema == s).unwrap_or(true);
      !(server_matches && schema_matches)
    });
  }

  /// Total number of cached rows, local and remote.
  pub fn len(&self) -> usize {
    self.tables.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn remote_locations(&self) -> impl Iterator<Item = &Location> {
    self.tables.keys().filter(|location| !location.is_local())
  }

  fn retain_remote<F>(&mut self, mut keep: F) -> usize
  where
    F: FnMut(&Location, &RowKey, &Row) -> bool,
  {
    let mut removed = 0;
    for (location, rows) in self.tables.iter_mut() {
      if location.is_local() {
        continue;
      }
      let before = rows.len();
      rows.retain(|row| match row_key(location, row) {
        Some(key) => keep(location, &key, row),
        None => false,
      });
      removed += before - rows.len();
    }
    removed
  }

  fn persist(&self) -> Result<()> {
    let local: BTreeMap<&str, &Vec<Row>> = self
      .tables
      .iter()
      .filter(|(location, _)| location.schema == LOCAL_SCHEMA)
      .map(|(location, rows)| (location.table.as_str(), rows))
      .collect();
    let blob =
      serde_json::to_string(&local).map_err(|e| eyre!("Failed to serialize local cache: {}", e))?;
    self.store.save(&self.database, &blob)
  }
}

/// Binary search for `key` in a key-sorted row array.
fn position(location: &Location, rows: &[Row], key: &RowKey) -> std::result::Result<usize, usize> {
  rows.binary_search_by(|row| match row_key(location, row) {
    Some(k) => k.cmp(key),
    None => std::cmp::Ordering::Less,
  })
}
