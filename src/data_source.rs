//! Remote data source: the entry point that answers queries from the local
//! cache, the server, or both.
//!
//! Every distinct query maps to one registered [`Search`]. Callers issuing
//! the same query share that Search and any fetch it has in flight, so only
//! one request per query signature is outstanding at a time. A fetch runs on
//! its own task and completes even if every caller stops waiting.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::row::{row_key, stamp_rtime};
use crate::cache::{CleanCriteria, LocalCache, PersistentStore};
use crate::config::Config;
use crate::criteria::Criteria;
use crate::event::{DataSourceEvent, EventBus};
use crate::notification::{
  Backoff, BridgeEvent, BridgeHandle, NotificationBridge, NotificationTransport,
};
use crate::remote::RemoteSource;
use crate::search::Search;
use crate::types::{ChangeEvent, Location, NotificationMessage, Query, Row, RowKey};

/// Outcome of a fetch, shared by every caller waiting on it.
type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Vec<Row>, String>>>;

/// Why a query could not be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The data source is offline and the cache cannot satisfy the query
  Offline { location: Location },
  /// The server request failed and the cache cannot satisfy the query
  Remote { location: Location, message: String },
}

impl fmt::Display for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FetchError::Offline { location } => {
        write!(f, "Offline and no sufficient cached data for {}", location)
      }
      FetchError::Remote { location, message } => {
        write!(f, "Failed to fetch {}: {}", location, message)
      }
    }
  }
}

impl std::error::Error for FetchError {}

/// Tunables taken from [`Config`].
#[derive(Debug, Clone)]
struct Settings {
  default_server: Option<String>,
  refresh_interval: Duration,
  disconnected_refresh_interval: Duration,
  max_searches: usize,
}

struct SearchEntry {
  /// Distinguishes this entry from a later one registered under the same
  /// signature
  id: u64,
  search: Search,
  pending: Option<SharedFetch>,
  last_access: u64,
  /// Notifications that have hit this Search so far
  invalidations: u64,
  /// Value of `invalidations` when the pending fetch started
  fetch_invalidations: u64,
}

impl SearchEntry {
  fn new(search: Search, tick: u64) -> Self {
    Self {
      id: tick,
      search,
      pending: None,
      last_access: tick,
      invalidations: 0,
      fetch_invalidations: 0,
    }
  }
}

struct State<S: PersistentStore> {
  cache: LocalCache<S>,
  searches: HashMap<String, SearchEntry>,
  online: bool,
  /// Servers whose push channel is currently open
  connected: HashSet<String>,
  clock: u64,
}

impl<S: PersistentStore> State<S> {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  /// Drop least recently used Searches beyond `max`, never one with a fetch
  /// in flight and never `keep`.
  fn evict_searches(&mut self, max: usize, keep: &str) {
    while self.searches.len() > max {
      let victim = self
        .searches
        .iter()
        .filter(|(signature, entry)| signature.as_str() != keep && entry.pending.is_none())
        .min_by_key(|(_, entry)| entry.last_access)
        .map(|(signature, _)| signature.clone());
      match victim {
        Some(signature) => {
          self.searches.remove(&signature);
        }
        None => break,
      }
    }
  }

  fn searches_at<'a>(&'a mut self, location: &'a Location) -> impl Iterator<Item = &'a mut SearchEntry> {
    self
      .searches
      .values_mut()
      .filter(move |entry| entry.search.location() == location)
  }
}

struct Inner<R: RemoteSource, S: PersistentStore> {
  remote: R,
  state: Mutex<State<S>>,
  events: EventBus,
  settings: Settings,
  session_start: DateTime<Utc>,
}

/// What `find` decided while holding the lock.
enum Plan {
  Ready(Vec<Row>),
  Wait {
    fetch: SharedFetch,
    partial: Vec<Row>,
    cached: bool,
  },
}

pub struct RemoteDataSource<R: RemoteSource, S: PersistentStore + 'static> {
  inner: Arc<Inner<R, S>>,
}

impl<R: RemoteSource, S: PersistentStore + 'static> Clone for RemoteDataSource<R, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<R: RemoteSource, S: PersistentStore + 'static> RemoteDataSource<R, S> {
  /// Create a data source. The session starts now: rows retrieved earlier
  /// are never trusted without asking the server.
  pub fn new(remote: R, cache: LocalCache<S>, config: &Config) -> Self {
    let settings = Settings {
      default_server: config.server.clone(),
      refresh_interval: config.refresh_interval(),
      disconnected_refresh_interval: config.disconnected_refresh_interval(),
      max_searches: config.cache.max_searches.max(1),
    };
    let state = State {
      cache,
      searches: HashMap::new(),
      online: true,
      connected: HashSet::new(),
      clock: 0,
    };

    Self {
      inner: Arc::new(Inner {
        remote,
        state: Mutex::new(state),
        events: EventBus::default(),
        settings,
        session_start: Utc::now(),
      }),
    }
  }

  /// Observe changes, invalidations, alerts and connection state.
  pub fn subscribe(&self) -> broadcast::Receiver<DataSourceEvent> {
    self.inner.events.subscribe()
  }

  fn lock(&self) -> Result<MutexGuard<'_, State<S>>> {
    self
      .inner
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Fill in the default server for remote queries that name none.
  fn resolve(&self, query: &Query) -> Query {
    let mut query = query.clone();
    if query.server.is_none() && query.schema != crate::types::LOCAL_SCHEMA {
      query.server = self.inner.settings.default_server.clone();
    }
    query
  }

  fn refresh_interval(&self, state: &State<S>, server: &str) -> Duration {
    if state.connected.contains(server) {
      self.inner.settings.refresh_interval
    } else {
      self.inner.settings.disconnected_refresh_interval
    }
  }

  // ==========================================================================
  // Queries
  // ==========================================================================

  /// Answer a query.
  ///
  /// Fresh results come straight from the registered Search. Cached rows
  /// that are sufficient are returned at once while a refresh runs in the
  /// background. Otherwise the caller waits for the server; if that fails,
  /// `required` queries get a [`FetchError`] and the rest get whatever
  /// partial results exist.
  pub async fn find(&self, query: &Query) -> Result<Vec<Row>> {
    let query = self.resolve(query);
    let candidate = Search::from_query(&query);
    let location = candidate.location().clone();

    if location.is_local() {
      let state = self.lock()?;
      return Ok(state.cache.find(&location, candidate.criteria()));
    }

    let required = candidate.options().required;
    let plan = {
      let mut state = self.lock()?;
      let interval = self.refresh_interval(&state, &location.server);
      let online = state.online;
      let max_searches = self.inner.settings.max_searches;
      let tick = state.tick();
      let signature = candidate.signature().to_string();

      if let Some(existing) = state.searches.get(&signature) {
        debug_assert!(existing.search.matches(&candidate));
      } else {
        let mut search = candidate;
        let rows = state.cache.find(&location, search.criteria());
        debug!("New search on {} with {} cached rows", location, rows.len());
        search.set_cached_results(rows);
        state
          .searches
          .insert(signature.clone(), SearchEntry::new(search, tick));
        state.evict_searches(max_searches, &signature);
      }

      let entry = state
        .searches
        .get_mut(&signature)
        .ok_or_else(|| eyre!("Search for {} vanished from the registry", location))?;
      entry.last_access = tick;

      let force = entry.search.options().remote;
      let cached = entry.search.is_sufficiently_cached();
      let complete =
        entry.search.options().expected.is_none() || entry.search.is_meeting_expectation();
      let current: Vec<Row> = entry.search.results().map(<[Row]>::to_vec).unwrap_or_default();

      let trusted = !force
        && (entry.search.is_fresh(interval)
          || (!entry.search.is_dirty()
            && cached
            && complete
            && entry
              .search
              .is_sufficiently_recent(interval, self.inner.session_start)));

      if trusted {
        Plan::Ready(current)
      } else if !online {
        if !cached && required {
          return Err(FetchError::Offline { location }.into());
        }
        Plan::Ready(current)
      } else {
        let fetch = self.start_refresh(&signature, entry);
        if cached && !force {
          debug!("Serving cached {} while refreshing", location);
          Plan::Ready(current)
        } else {
          Plan::Wait {
            fetch,
            partial: current,
            cached,
          }
        }
      }
    };

    match plan {
      Plan::Ready(rows) => Ok(rows),
      Plan::Wait {
        fetch,
        partial,
        cached,
      } => match fetch.await {
        Ok(rows) => Ok(rows),
        Err(message) if required && !cached => {
          Err(FetchError::Remote { location, message }.into())
        }
        Err(_) => Ok(partial),
      },
    }
  }

  /// Join the Search's fetch in flight, or start one.
  fn start_refresh(&self, signature: &str, entry: &mut SearchEntry) -> SharedFetch {
    if let Some(pending) = &entry.pending {
      return pending.clone();
    }
    entry.fetch_invalidations = entry.invalidations;

    let source = self.clone();
    let signature = signature.to_string();
    let entry_id = entry.id;
    let location = entry.search.location().clone();
    let criteria = entry.search.criteria().clone();
    let task: JoinHandle<std::result::Result<Vec<Row>, String>> = tokio::spawn(async move {
      let outcome = source.inner.remote.fetch(&location, &criteria).await;
      source.complete_refresh(&signature, entry_id, &location, &criteria, outcome)
    });

    let fetch = async move {
      match task.await {
        Ok(outcome) => outcome,
        Err(e) => Err(format!("Refresh task failed: {}", e)),
      }
    }
    .boxed()
    .shared();
    entry.pending = Some(fetch.clone());
    fetch
  }

  fn complete_refresh(
    &self,
    signature: &str,
    entry_id: u64,
    location: &Location,
    criteria: &Criteria,
    outcome: Result<Vec<Row>>,
  ) -> std::result::Result<Vec<Row>, String> {
    let mut state = self
      .inner
      .state
      .lock()
      .map_err(|e| format!("Lock poisoned: {}", e))?;

    let mut rows = match outcome {
      Ok(rows) => rows,
      Err(e) => {
        if let Some(entry) = state
          .searches
          .get_mut(signature)
          .filter(|entry| entry.id == entry_id)
        {
          entry.pending = None;
        }
        drop(state);
        warn!("Refresh of {} failed: {}", location, e);
        self.inner.events.emit(DataSourceEvent::FetchFailed {
          location: location.clone(),
          message: e.to_string(),
        });
        return Err(e.to_string());
      }
    };

    let now = Utc::now();
    for row in rows.iter_mut() {
      stamp_rtime(row, now);
    }

    let registered = state
      .searches
      .get(signature)
      .map(|entry| entry.id == entry_id)
      .unwrap_or(false);
    if !registered {
      // Reset or abandoned while the request was out
      debug!("Discarding refresh of {} for a dropped search", location);
      return Ok(rows);
    }

    // Rows the server no longer returns for these criteria are gone. A limit
    // only says which rows made the cut, not which still exist.
    let returned: HashSet<RowKey> = rows.iter().filter_map(|r| row_key(location, r)).collect();
    let previous = match criteria.limit() {
      Some(_) => &[][..],
      None => state
        .searches
        .get(signature)
        .and_then(|entry| entry.search.results())
        .unwrap_or_default(),
    };
    let vanished: Vec<Row> = previous
      .iter()
      .filter(|row| match row_key(location, row) {
        Some(key) => !key.is_temporary() && !returned.contains(&key) && criteria.matches(row),
        None => false,
      })
      .cloned()
      .collect();

    if let Err(e) = state.cache.save(location, &rows) {
      warn!("Failed to cache rows for {}: {}", location, e);
    }
    if !vanished.is_empty() {
      debug!("Dropping {} vanished rows from {}", vanished.len(), location);
      if let Err(e) = state.cache.remove(location, &vanished) {
        warn!("Failed to drop vanished rows for {}: {}", location, e);
      }
    }

    let results = match state.searches.get_mut(signature) {
      Some(entry) => {
        let mut refreshed = entry.search.refreshed(rows, now);
        if entry.invalidations != entry.fetch_invalidations {
          // A change arrived while the request was out
          refreshed.mark_dirty();
        }
        entry.search = refreshed;
        entry.pending = None;
        entry.search.results().map(<[Row]>::to_vec).unwrap_or_default()
      }
      None => rows,
    };
    drop(state);

    self.inner.events.emit(DataSourceEvent::Change {
      location: location.clone(),
    });
    Ok(results)
  }

  /// Snapshot of the registered Search for `query`, if any.
  pub fn search(&self, query: &Query) -> Result<Option<Search>> {
    let candidate = Search::from_query(&self.resolve(query));
    let state = self.lock()?;
    Ok(
      state
        .searches
        .get(candidate.signature())
        .map(|entry| entry.search.clone()),
    )
  }

  pub fn search_count(&self) -> Result<usize> {
    Ok(self.lock()?.searches.len())
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Save `objects` at `location`.
  ///
  /// Local-schema rows go straight to the cache. Remote rows that already
  /// carry an id are shown to readers immediately and rolled back if the
  /// server rejects them. Once the server answers, rows saved under a
  /// temporary id are replaced by the permanent ones.
  pub async fn save(&self, location: &Location, objects: &[Row]) -> Result<Vec<Row>> {
    if location.is_local() {
      let saved = {
        let mut state = self.lock()?;
        state.cache.save(location, objects)?
      };
      self.emit_change(location);
      return Ok(saved);
    }

    let previous = {
      let mut state = self.lock()?;
      if !state.online {
        return Err(
          FetchError::Offline {
            location: location.clone(),
          }
          .into(),
        );
      }
      let previous: Vec<(RowKey, Option<Row>)> = objects
        .iter()
        .filter_map(|object| row_key(location, object))
        .map(|key| {
          let lookup = Criteria::new().with(location.key_field(), key_value(&key));
          let existing = state.cache.find(location, &lookup).into_iter().next();
          (key, existing)
        })
        .collect();

      let optimistic = state.cache.save(location, objects)?;
      for entry in state.searches_at(location) {
        entry.search.apply_saved(&optimistic);
      }
      previous
    };
    self.emit_change(location);

    let outcome = self.inner.remote.save(location, objects).await;
    let mut saved = match outcome {
      Ok(saved) => saved,
      Err(e) => {
        self.roll_back(location, previous)?;
        self.emit_change(location);
        return Err(e);
      }
    };

    let now = Utc::now();
    for row in saved.iter_mut() {
      stamp_rtime(row, now);
    }

    {
      let mut state = self.lock()?;
      let temporary: Vec<Row> = objects
        .iter()
        .filter(|object| {
          row_key(location, object)
            .map(|key| key.is_temporary())
            .unwrap_or(false)
        })
        .cloned()
        .collect();
      let temporary_keys: Vec<RowKey> = temporary
        .iter()
        .filter_map(|object| row_key(location, object))
        .collect();

      state.cache.remove(location, &temporary)?;
      state.cache.save(location, &saved)?;
      for entry in state.searches_at(location) {
        entry.search.apply_removed(&temporary_keys);
        entry.search.apply_saved(&saved);
      }
    }
    self.emit_change(location);
    Ok(saved)
  }

  /// Restore rows overwritten by an optimistic save.
  fn roll_back(&self, location: &Location, previous: Vec<(RowKey, Option<Row>)>) -> Result<()> {
    let mut state = self.lock()?;
    for (key, row) in previous {
      match row {
        Some(row) => {
          let restored = state.cache.save(location, std::slice::from_ref(&row))?;
          for entry in state.searches_at(location) {
            entry.search.apply_saved(&restored);
          }
        }
        None => {
          let mut stub = Row::new();
          stub.insert(location.key_field().to_string(), key_value(&key));
          state.cache.remove(location, &[stub])?;
          for entry in state.searches_at(location) {
            entry.search.apply_removed(std::slice::from_ref(&key));
          }
        }
      }
    }
    Ok(())
  }

  /// Remove `objects` at `location`, remotely first for remote schemas.
  pub async fn remove(&self, location: &Location, objects: &[Row]) -> Result<Vec<Row>> {
    let removed = if location.is_local() {
      objects.to_vec()
    } else {
      if !self.lock()?.online {
        return Err(
          FetchError::Offline {
            location: location.clone(),
          }
          .into(),
        );
      }
      self.inner.remote.remove(location, objects).await?
    };

    {
      let mut state = self.lock()?;
      let keys: Vec<RowKey> = objects
        .iter()
        .chain(removed.iter())
        .filter_map(|object| row_key(location, object))
        .collect();
      state.cache.remove(location, objects)?;
      for entry in state.searches_at(location) {
        entry.search.apply_removed(&keys);
      }
    }
    self.emit_change(location);
    Ok(removed)
  }

  fn emit_change(&self, location: &Location) {
    self.inner.events.emit(DataSourceEvent::Change {
      location: location.clone(),
    });
  }

  // ==========================================================================
  // Change notifications
  // ==========================================================================

  /// Mark Searches on `server` that the changes could affect as dirty.
  ///
  /// The changed rows are also dropped from the cache so that new Searches
  /// go to the server for them. Returns the number of Searches dirtied.
  pub fn invalidate(&self, server: &str, changes: &[ChangeEvent]) -> Result<usize> {
    let dirtied = {
      let mut state = self.lock()?;
      for change in changes {
        let location = Location::new(Some(server), &change.schema, &change.table);
        let mut stub = Row::new();
        stub.insert("id".to_string(), change.id.into());
        state.cache.remove(&location, &[stub])?;
      }

      let mut dirtied = 0;
      for entry in state.searches.values_mut() {
        let location = entry.search.location();
        if location.server != server || location.is_local() {
          continue;
        }
        if changes.iter().any(|change| entry.search.could_include(change)) {
          entry.search.mark_dirty();
          entry.invalidations += 1;
          dirtied += 1;
        }
      }
      dirtied
    };

    if dirtied > 0 {
      debug!("{} change(s) on {} dirtied {} searches", changes.len(), server, dirtied);
      self.inner.events.emit(DataSourceEvent::Dirty {
        server: server.to_string(),
        searches: dirtied,
      });
    }
    Ok(dirtied)
  }

  /// Mark every remote Search on `server` dirty.
  fn invalidate_server(&self, server: &str) -> Result<usize> {
    let mut state = self.lock()?;
    let mut dirtied = 0;
    for entry in state.searches.values_mut() {
      let location = entry.search.location();
      if location.server == server && !location.is_local() {
        entry.search.mark_dirty();
        entry.invalidations += 1;
        dirtied += 1;
      }
    }
    Ok(dirtied)
  }

  /// Apply one event from a notification bridge.
  pub async fn handle_bridge_event(&self, server: &str, event: BridgeEvent) -> Result<()> {
    match event {
      BridgeEvent::Connected => {
        self.lock()?.connected.insert(server.to_string());
        // Changes made while nobody was listening went unreported
        let dirtied = self.invalidate_server(server)?;
        info!("Listening for changes on {} ({} searches to revalidate)", server, dirtied);
        self.inner.events.emit(DataSourceEvent::Connection {
          server: server.to_string(),
          connected: true,
        });
      }
      BridgeEvent::Disconnected => {
        self.lock()?.connected.remove(server);
        info!("Lost change notifications from {}", server);
        self.inner.events.emit(DataSourceEvent::Connection {
          server: server.to_string(),
          connected: false,
        });
      }
      BridgeEvent::Message(NotificationMessage::Changes(changes)) => {
        self.invalidate(server, &changes)?;
      }
      BridgeEvent::Message(NotificationMessage::Alert(alert)) => {
        self.inner.events.emit(DataSourceEvent::Alert {
          server: server.to_string(),
          alert,
        });
      }
      BridgeEvent::Message(NotificationMessage::Socket(token)) => {
        self.inner.remote.subscribe(server, &token).await?;
        debug!("Subscribed to changes on {}", server);
      }
    }
    Ok(())
  }

  /// Listen for change notifications from `server`.
  ///
  /// Events are applied one at a time in arrival order.
  pub fn attach<T: NotificationTransport>(
    &self,
    transport: T,
    server: &str,
    backoff: Backoff,
  ) -> NotificationHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let bridge = NotificationBridge::new(transport, server, backoff, tx).spawn();

    let source = self.clone();
    let server = server.to_string();
    let dispatcher = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        if let Err(e) = source.handle_bridge_event(&server, event).await {
          warn!("Failed to handle notification from {}: {}", server, e);
        }
      }
    });

    NotificationHandle { bridge, dispatcher }
  }

  // ==========================================================================
  // Activation and housekeeping
  // ==========================================================================

  pub fn is_online(&self) -> Result<bool> {
    Ok(self.lock()?.online)
  }

  /// Switch between online and offline operation.
  ///
  /// Going online revalidates every Search that is dirty or stale. Returns
  /// the number of refreshes started.
  pub fn set_online(&self, online: bool) -> Result<usize> {
    let mut state = self.lock()?;
    let was_online = state.online;
    state.online = online;
    if !online || was_online {
      return Ok(0);
    }

    let mut started = 0;
    let intervals: HashMap<String, Duration> = state
      .searches
      .values()
      .map(|entry| entry.search.location().server.clone())
      .collect::<HashSet<_>>()
      .into_iter()
      .map(|server| {
        let interval = self.refresh_interval(&state, &server);
        (server, interval)
      })
      .collect();

    for (signature, entry) in state.searches.iter_mut() {
      let location = entry.search.location();
      if location.is_local() || entry.search.results().is_none() {
        continue;
      }
      let interval = intervals
        .get(&location.server)
        .copied()
        .unwrap_or(self.inner.settings.disconnected_refresh_interval);
      if entry.search.is_dirty() || !entry.search.is_fresh(interval) {
        let _refresh = self.start_refresh(signature, entry);
        started += 1;
      }
    }
    info!("Back online, revalidating {} searches", started);
    Ok(started)
  }

  /// Evict cached remote rows.
  pub fn clean(&self, criteria: &CleanCriteria) -> Result<usize> {
    Ok(self.lock()?.cache.clean(criteria))
  }

  /// Clear remote data and the Searches built on it.
  pub fn reset(&self, server: Option<&str>, schema: Option<&str>) -> Result<()> {
    let mut state = self.lock()?;
    state.cache.reset(server, schema);
    state.searches.retain(|_, entry| {
      let location = entry.search.location();
      if location.is_local() {
        return true;
      }
      let server_matches = server.map(|s| location.server == s).unwrap_or(true);
      let schema_matches = schema.map(|s| location.schema == s).unwrap_or(true);
      !(server_matches && schema_matches)
    });
    Ok(())
  }

  /// Forget everything retrieved from `server`.
  pub fn abandon(&self, server: &str) -> Result<usize> {
    let mut state = self.lock()?;
    state
      .searches
      .retain(|_, entry| entry.search.location().server != server);
    state.connected.remove(server);
    Ok(state.cache.clean(&CleanCriteria::Server(server.to_string())))
  }
}

fn key_value(key: &RowKey) -> serde_json::Value {
  match key {
    RowKey::Int(id) => (*id).into(),
    RowKey::Text(text) => text.clone().into(),
  }
}

/// Running notification bridge plus the task applying its events.
pub struct NotificationHandle {
  bridge: BridgeHandle,
  dispatcher: JoinHandle<()>,
}

impl NotificationHandle {
  /// Stop listening. Events already received are still applied.
  pub async fn shutdown(self) {
    self.bridge.shutdown().await;
    let _ = self.dispatcher.await;
  }
}
