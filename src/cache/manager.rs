//! In-memory query cache with staleness, garbage collection and single-flight fetching.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

use super::traits::{CacheResult, QueryKey};
use crate::clock::{Clock, SystemClock};
use crate::error::{RemoteError, StateError, StateResult};

/// Default freshness window of a fetched entry, in seconds.
pub const DEFAULT_STALE_SECS: i64 = 60 * 60;
/// Default time after which an entry is evicted from memory, in seconds.
pub const DEFAULT_GC_SECS: i64 = 24 * 60 * 60;

const EVENT_CAPACITY: usize = 256;

/// Cache-wide defaults.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
  pub stale_time: Duration,
  pub gc_time: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::seconds(DEFAULT_STALE_SECS),
      gc_time: Duration::seconds(DEFAULT_GC_SECS),
    }
  }
}

/// What `get` does with a stale entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchPolicy {
  /// Wait for a fresh fetch
  #[default]
  Blocking,
  /// Return the stale data now and refresh in the background
  StaleWhileRevalidate,
}

/// Per-query overrides of the cache defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
  pub stale_time: Option<Duration>,
  pub gc_time: Option<Duration>,
  /// Entries older than this are not restored from a persisted snapshot
  pub max_persist_age: Option<Duration>,
  pub refetch: RefetchPolicy,
}

impl QueryOptions {
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = Some(gc_time);
    self
  }

  pub fn max_persist_age(mut self, max_age: Duration) -> Self {
    self.max_persist_age = Some(max_age);
    self
  }

  pub fn stale_while_revalidate(mut self) -> Self {
    self.refetch = RefetchPolicy::StaleWhileRevalidate;
    self
  }
}

/// One cached query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub data: Value,
  pub fetched_at: DateTime<Utc>,
  pub stale_at: DateTime<Utc>,
  pub gc_time_ms: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub persist_until: Option<DateTime<Utc>>,
}

impl CacheEntry {
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    now < self.stale_at
  }

  pub fn gc_time(&self) -> Duration {
    Duration::milliseconds(self.gc_time_ms)
  }

  /// Untouched for longer than its gc time.
  pub fn is_collectable(&self, now: DateTime<Utc>) -> bool {
    self.fetched_at + self.gc_time() < now
  }
}

/// Mutation notifications, consumed by the persister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  Updated(String),
  Removed(String),
  Cleared,
}

type FlightResult = Result<Value, RemoteError>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;

enum Slot {
  Joined(Flight),
  Reserved {
    id: u64,
    flight: Flight,
    done: oneshot::Sender<FlightResult>,
  },
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, CacheEntry>,
  /// Fetches in progress, tagged with an id so a detached fetch cannot clear its successor
  in_flight: HashMap<String, (u64, Flight)>,
}

struct CacheInner {
  state: Mutex<CacheState>,
  config: CacheConfig,
  clock: Arc<dyn Clock>,
  events: broadcast::Sender<CacheEvent>,
  next_flight: AtomicU64,
}

/// The query cache of one context. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<CacheInner>,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new(CacheConfig::default())
  }
}

impl QueryCache {
  pub fn new(config: CacheConfig) -> Self {
    Self::with_clock(config, Arc::new(SystemClock))
  }

  pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(CacheInner {
        state: Mutex::new(CacheState::default()),
        config,
        clock,
        events,
        next_flight: AtomicU64::new(0),
      }),
    }
  }

  pub fn config(&self) -> CacheConfig {
    self.inner.config
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  /// Subscribe to mutation events.
  pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
    self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn emit(&self, event: CacheEvent) {
    let _ = self.inner.events.send(event);
  }

  /// Fetch through the cache with default options.
  pub async fn get<K, T, F, Fut, E>(&self, key: &K, fetcher: F) -> StateResult<CacheResult<T>>
  where
    K: QueryKey + Sync + ?Sized,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Display,
  {
    self.get_with(key, QueryOptions::default(), fetcher).await
  }

  /// Fetch through the cache.
  ///
  /// A fresh entry is returned without calling `fetcher`. Otherwise the fetch
  /// runs on its own task; concurrent callers for the same key share it.
  /// `fetcher` is called after the cache lock is released, so it may read the cache.
  pub async fn get_with<K, T, F, Fut, E>(
    &self,
    key: &K,
    options: QueryOptions,
    fetcher: F,
  ) -> StateResult<CacheResult<T>>
  where
    K: QueryKey + Sync + ?Sized,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Display,
  {
    trace!(query = %key.description(), "cache lookup");
    let key = key.cache_key();
    let now = self.now();

    let (slot, stale_hit) = {
      let mut state = self.lock();
      let cached = state
        .entries
        .get(&key)
        .map(|e| (e.is_fresh(now), e.fetched_at, e.data.clone()));

      let mut stale_hit = None;
      if let Some((fresh, fetched_at, data)) = cached {
        match serde_json::from_value::<T>(data) {
          Ok(data) if fresh => return Ok(CacheResult::from_cache(data, fetched_at, false)),
          Ok(data) if options.refetch == RefetchPolicy::StaleWhileRevalidate => {
            stale_hit = Some((data, fetched_at));
          }
          Ok(_) => {}
          Err(e) => {
            // Shape no longer matches the requested type; refetch
            debug!(%key, error = %e, "dropping undecodable cache entry");
            state.entries.remove(&key);
          }
        }
      }

      (self.reserve(&mut state, &key), stale_hit)
    };

    let flight = match slot {
      Slot::Joined(flight) => flight,
      Slot::Reserved { id, flight, done } => {
        self.launch(key.clone(), id, options, fetcher, done);
        flight
      }
    };

    if let Some((data, fetched_at)) = stale_hit {
      // The refresh keeps running on its own task
      drop(flight);
      return Ok(CacheResult::from_cache(data, fetched_at, true));
    }

    let value = flight.await?;
    let data = serde_json::from_value(value)
      .map_err(|source| StateError::Deserialization { key, source })?;
    Ok(CacheResult::from_network(data))
  }

  /// Join the fetch in progress for `key`, or claim the slot for a new one.
  fn reserve(&self, state: &mut CacheState, key: &str) -> Slot {
    if let Some((_, flight)) = state.in_flight.get(key) {
      debug!(%key, "joining in-flight fetch");
      return Slot::Joined(flight.clone());
    }

    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
    let (done, outcome) = oneshot::channel();
    let flight = async move {
      outcome
        .await
        .unwrap_or_else(|_| Err(RemoteError::new("fetch task failed")))
    }
    .boxed()
    .shared();

    state.in_flight.insert(key.to_string(), (id, flight.clone()));
    Slot::Reserved { id, flight, done }
  }

  /// Run the fetcher for a reserved slot on its own task.
  fn launch<T, F, Fut, E>(
    &self,
    key: String,
    id: u64,
    options: QueryOptions,
    fetcher: F,
    done: oneshot::Sender<FlightResult>,
  ) where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Display,
  {
    debug!(%key, "starting fetch");
    let request = fetcher();
    let cache = self.clone();

    // Runs to completion even if every caller stops waiting
    tokio::spawn(async move {
      let result = match request.await {
        Ok(data) => serde_json::to_value(data)
          .map_err(|e| RemoteError::new(format!("unserializable response: {}", e))),
        Err(e) => Err(RemoteError::new(e)),
      };
      cache.settle(&key, id, options, &result);
      let _ = done.send(result);
    });
  }

  /// Record the outcome of fetch `id` unless it was detached by an invalidation.
  fn settle(&self, key: &str, id: u64, options: QueryOptions, result: &FlightResult) {
    let now = self.now();
    {
      let mut state = self.lock();
      match state.in_flight.get(key) {
        Some((current, _)) if *current == id => {
          state.in_flight.remove(key);
        }
        _ => return,
      }

      let Ok(data) = result else {
        return;
      };
      let stale_time = options.stale_time.unwrap_or(self.inner.config.stale_time);
      let gc_time = options.gc_time.unwrap_or(self.inner.config.gc_time);
      state.entries.insert(
        key.to_string(),
        CacheEntry {
          data: data.clone(),
          fetched_at: now,
          stale_at: now + stale_time,
          gc_time_ms: gc_time.num_milliseconds(),
          persist_until: options.max_persist_age.map(|age| now + age),
        },
      );
    }
    self.emit(CacheEvent::Updated(key.to_string()));
  }

  /// Store `data` under `key` as if it had just been fetched.
  pub fn set_query_data<K, T>(&self, key: &K, data: &T, options: QueryOptions) -> StateResult<()>
  where
    K: QueryKey + ?Sized,
    T: Serialize,
  {
    let key = key.cache_key();
    let data = serde_json::to_value(data).map_err(StateError::Serialization)?;
    let now = self.now();
    let stale_time = options.stale_time.unwrap_or(self.inner.config.stale_time);
    let gc_time = options.gc_time.unwrap_or(self.inner.config.gc_time);

    self.lock().entries.insert(
      key.clone(),
      CacheEntry {
        data,
        fetched_at: now,
        stale_at: now + stale_time,
        gc_time_ms: gc_time.num_milliseconds(),
        persist_until: options.max_persist_age.map(|age| now + age),
      },
    );
    self.emit(CacheEvent::Updated(key));
    Ok(())
  }

  /// Remove one entry; the next `get` refetches.
  pub fn invalidate<K: QueryKey + ?Sized>(&self, key: &K) -> bool {
    let key = key.cache_key();
    let removed = {
      let mut state = self.lock();
      state.in_flight.remove(&key);
      state.entries.remove(&key).is_some()
    };
    if removed {
      self.emit(CacheEvent::Removed(key));
    }
    removed
  }

  /// Remove every entry matching `predicate`. Returns how many were removed.
  pub fn invalidate_where<P>(&self, predicate: P) -> usize
  where
    P: Fn(&str, &CacheEntry) -> bool,
  {
    let removed: Vec<String> = {
      let mut state = self.lock();
      let keys: Vec<String> = state
        .entries
        .iter()
        .filter(|(k, e)| predicate(k, e))
        .map(|(k, _)| k.clone())
        .collect();
      for key in &keys {
        state.entries.remove(key);
        state.in_flight.remove(key);
      }
      keys
    };

    let count = removed.len();
    for key in removed {
      self.emit(CacheEvent::Removed(key));
    }
    count
  }

  /// Drop everything, in-flight fetches included.
  pub fn clear(&self) {
    {
      let mut state = self.lock();
      state.entries.clear();
      state.in_flight.clear();
    }
    self.emit(CacheEvent::Cleared);
  }

  /// Evict entries not fetched within their gc time. Returns how many were evicted.
  pub fn garbage_collect(&self, now: DateTime<Utc>) -> usize {
    let evicted: Vec<String> = {
      let mut state = self.lock();
      let keys: Vec<String> = state
        .entries
        .iter()
        .filter(|(k, e)| e.is_collectable(now) && !state.in_flight.contains_key(*k))
        .map(|(k, _)| k.clone())
        .collect();
      for key in &keys {
        state.entries.remove(key);
      }
      keys
    };

    if !evicted.is_empty() {
      debug!(count = evicted.len(), "garbage collected cache entries");
    }
    let count = evicted.len();
    for key in evicted {
      self.emit(CacheEvent::Removed(key));
    }
    count
  }

  pub fn entry<K: QueryKey + ?Sized>(&self, key: &K) -> Option<CacheEntry> {
    self.lock().entries.get(&key.cache_key()).cloned()
  }

  pub fn is_fetching<K: QueryKey + ?Sized>(&self, key: &K) -> bool {
    self.lock().in_flight.contains_key(&key.cache_key())
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Every entry, ordered by key.
  pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
    self
      .lock()
      .entries
      .iter()
      .map(|(k, e)| (k.clone(), e.clone()))
      .collect()
  }

  /// Load entries verbatim, keeping their timestamps. Emits no events.
  pub fn hydrate(&self, entries: impl IntoIterator<Item = (String, CacheEntry)>) {
    let mut state = self.lock();
    for (key, entry) in entries {
      state.entries.insert(key, entry);
    }
  }

  /// Merge a snapshot another context wrote at `as_of`. Emits no events.
  ///
  /// The newer `fetched_at` wins per key. Local entries the other context no
  /// longer had are dropped unless they were fetched after `as_of`.
  /// Returns the number of entries changed.
  pub fn reconcile(&self, external: BTreeMap<String, CacheEntry>, as_of: DateTime<Utc>) -> usize {
    let mut state = self.lock();
    let mut changed = 0;

    state.entries.retain(|key, local| {
      let keep = external.contains_key(key) || local.fetched_at > as_of;
      if !keep {
        changed += 1;
      }
      keep
    });

    for (key, entry) in external {
      let newer = state
        .entries
        .get(&key)
        .map_or(true, |local| local.fetched_at < entry.fetched_at);
      if newer {
        state.entries.insert(key, entry);
        changed += 1;
      }
    }

    changed
  }
}
