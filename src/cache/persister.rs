//! Durable mirror of the query cache.
//!
//! The whole cache is stored as one JSON snapshot under a single key. Writes
//! are throttled: the first mutation arms a timer and the snapshot taken when
//! it fires carries every mutation made meanwhile. At startup the snapshot is
//! restored unless it was written by another build (buster) or is too old.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::{CacheEntry, CacheEvent, QueryCache};
use crate::error::StorageError;
use crate::storage::{ChangeEvent, KvStore};

/// Storage key of the cache snapshot.
pub const CACHE_KEY: &str = "queryCache";

/// Default minimum interval between snapshot writes.
pub const DEFAULT_THROTTLE: std::time::Duration = std::time::Duration::from_secs(1);

/// Default maximum age of a restorable snapshot, in seconds.
pub const DEFAULT_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Own snapshots remembered while their echoes are outstanding.
const MAX_UNECHOED: usize = 64;

/// The persisted form of the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCache {
  pub buster: String,
  pub timestamp: DateTime<Utc>,
  pub entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Clone)]
pub struct PersistOptions {
  pub key: String,
  /// Build version; snapshots from other versions are discarded
  pub buster: String,
  pub max_age: Duration,
  pub throttle: std::time::Duration,
}

impl Default for PersistOptions {
  fn default() -> Self {
    Self {
      key: CACHE_KEY.to_string(),
      buster: env!("CARGO_PKG_VERSION").to_string(),
      max_age: Duration::seconds(DEFAULT_MAX_AGE_SECS),
      throttle: DEFAULT_THROTTLE,
    }
  }
}

/// What happened when restoring the persisted snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
  /// Nothing was persisted
  Empty,
  /// This many entries were loaded
  Restored(usize),
  /// Written by another build; discarded
  BusterMismatch { stored: String },
  /// Older than the maximum age; discarded
  Expired,
  /// Not decodable; discarded
  Corrupt,
  /// Storage could not be read; starting empty
  Unavailable,
}

/// Bridges a [`QueryCache`] to the durable store.
#[derive(Clone)]
pub struct CachePersister {
  store: KvStore,
  cache: QueryCache,
  options: Arc<PersistOptions>,
  /// Snapshots written here whose echo has not come back yet, oldest first
  unechoed: Arc<Mutex<VecDeque<String>>>,
}

impl CachePersister {
  pub fn new(store: KvStore, cache: QueryCache, options: PersistOptions) -> Self {
    Self {
      store,
      cache,
      options: Arc::new(options),
      unechoed: Arc::new(Mutex::new(VecDeque::new())),
    }
  }

  pub fn options(&self) -> &PersistOptions {
    &self.options
  }

  /// Load the persisted snapshot into the cache, discarding it when invalid.
  pub async fn restore(&self) -> RestoreOutcome {
    let raw = match self.store.get(&self.options.key).await {
      Ok(Some(raw)) => raw,
      Ok(None) => return RestoreOutcome::Empty,
      Err(e) => {
        warn!(error = %e, "cache snapshot unavailable; starting empty");
        return RestoreOutcome::Unavailable;
      }
    };

    match self.decode(&raw) {
      Ok(snapshot) => {
        let count = snapshot.entries.len();
        self.cache.hydrate(snapshot.entries);
        debug!(count, "restored query cache");
        RestoreOutcome::Restored(count)
      }
      Err(outcome) => {
        info!(?outcome, "discarding persisted query cache");
        if let Err(e) = self.store.remove(&self.options.key).await {
          warn!(error = %e, "failed to remove discarded cache snapshot");
        }
        outcome
      }
    }
  }

  /// Decode a raw snapshot and drop what must not be served.
  fn decode(&self, raw: &str) -> Result<PersistedCache, RestoreOutcome> {
    let mut snapshot: PersistedCache =
      serde_json::from_str(raw).map_err(|_| RestoreOutcome::Corrupt)?;

    // Checked before touching any entry
    if snapshot.buster != self.options.buster {
      return Err(RestoreOutcome::BusterMismatch {
        stored: snapshot.buster,
      });
    }

    let now = self.cache.now();
    let max_age = self.options.max_age;
    if now - snapshot.timestamp > max_age {
      return Err(RestoreOutcome::Expired);
    }

    snapshot.entries.retain(|_, entry| {
      now - entry.fetched_at <= max_age && entry.persist_until.map_or(true, |until| now <= until)
    });
    Ok(snapshot)
  }

  /// Write the current cache snapshot now.
  pub async fn persist(&self) -> Result<(), StorageError> {
    let snapshot = PersistedCache {
      buster: self.options.buster.clone(),
      timestamp: self.cache.now(),
      entries: self.cache.snapshot(),
    };
    let raw = match serde_json::to_string(&snapshot) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(error = %e, "failed to serialize query cache");
        return Ok(());
      }
    };

    {
      let mut unechoed = self.lock_unechoed();
      if unechoed.len() == MAX_UNECHOED {
        unechoed.pop_front();
      }
      unechoed.push_back(raw.clone());
    }
    self.store.set(&self.options.key, raw).await?;
    debug!(entries = snapshot.entries.len(), "persisted query cache");
    Ok(())
  }

  fn lock_unechoed(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    self.unechoed.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// True if `raw` is the echo of one of our own writes.
  ///
  /// Echoes arrive in write order, so older snapshots still queued will never
  /// be echoed (unchanged writes publish nothing) and are dropped as well.
  fn take_own_echo(&self, raw: &str) -> bool {
    let mut unechoed = self.lock_unechoed();
    match unechoed.iter().position(|own| own == raw) {
      Some(index) => {
        unechoed.drain(..=index);
        true
      }
      None => false,
    }
  }

  async fn persist_logged(&self) {
    if let Err(e) = self.persist().await {
      warn!(error = %e, "query cache not persisted; continuing in memory");
    }
  }

  /// Merge a snapshot written by another context.
  fn apply_external(&self, raw: Option<String>) {
    if let Some(raw) = &raw {
      if self.take_own_echo(raw) {
        return;
      }
    }

    match raw {
      // Removed elsewhere: everything we fetched before now is gone there too
      None => {
        let dropped = self.cache.reconcile(BTreeMap::new(), self.cache.now());
        debug!(dropped, "query cache cleared by another context");
      }
      Some(raw) => match self.decode(&raw) {
        Ok(snapshot) => {
          let changed = self.cache.reconcile(snapshot.entries, snapshot.timestamp);
          debug!(changed, "rehydrated query cache from another context");
        }
        Err(outcome) => debug!(?outcome, "ignoring foreign cache snapshot"),
      },
    }
  }

  /// Start the background task that persists mutations and follows other contexts.
  pub fn spawn(self) -> PersisterHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (external_tx, external_rx) = mpsc::unbounded_channel();

    let listener_id = self.store.on_change(
      &self.options.key,
      Arc::new(move |event: &ChangeEvent| {
        let _ = external_tx.send(event.new_value.clone());
      }),
    );

    let events = self.cache.events();
    let task = tokio::spawn(async move {
      self.run(events, command_rx, external_rx).await;
      self.store.off_change(&self.options.key, listener_id);
    });

    PersisterHandle { commands, task }
  }

  async fn run(
    &self,
    mut events: broadcast::Receiver<CacheEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut external: mpsc::UnboundedReceiver<Option<String>>,
  ) {
    // Armed while a write is pending
    let mut deadline: Option<Instant> = None;

    loop {
      tokio::select! {
        event = events.recv() => match event {
          Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
            if deadline.is_none() {
              deadline = Some(Instant::now() + self.options.throttle);
            }
          }
          Err(broadcast::error::RecvError::Closed) => break,
        },
        _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
          deadline = None;
          self.persist_logged().await;
        }
        Some(raw) = external.recv() => self.apply_external(raw),
        command = commands.recv() => {
          // Mutations not yet seen by this loop count as pending too
          let mut dirty = deadline.take().is_some();
          loop {
            match events.try_recv() {
              Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => dirty = true,
              Err(_) => break,
            }
          }
          if dirty {
            self.persist_logged().await;
          }
          match command {
            Some(Command::Flush(ack)) => {
              let _ = ack.send(());
            }
            Some(Command::Shutdown(ack)) => {
              let _ = ack.send(());
              break;
            }
            // Handle dropped
            None => break,
          }
        }
      }
    }
  }
}

enum Command {
  Flush(oneshot::Sender<()>),
  Shutdown(oneshot::Sender<()>),
}

/// Control handle of a running persister.
///
/// Dropping it stops the task after any pending snapshot has been written.
pub struct PersisterHandle {
  commands: mpsc::UnboundedSender<Command>,
  task: JoinHandle<()>,
}

impl PersisterHandle {
  /// Write a pending snapshot immediately.
  pub async fn flush(&self) {
    let (ack, done) = oneshot::channel();
    if self.commands.send(Command::Flush(ack)).is_ok() {
      let _ = done.await;
    }
  }

  /// Write a pending snapshot and stop.
  pub async fn shutdown(self) {
    let (ack, done) = oneshot::channel();
    if self.commands.send(Command::Shutdown(ack)).is_ok() {
      let _ = done.await;
    }
    let _ = self.task.await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheConfig, QueryOptions};
  use crate::clock::ManualClock;
  use crate::storage::{MemoryBackend, MemoryService, StorageBackend, StorageFuture};
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Records when writes reach the backend.
  #[derive(Clone)]
  struct CountingBackend {
    inner: MemoryBackend,
    writes: Arc<Mutex<Vec<Instant>>>,
  }

  impl StorageBackend for CountingBackend {
    fn get(&self, keys: Vec<String>) -> StorageFuture<'_, HashMap<String, String>> {
      self.inner.get(keys)
    }

    fn set(&self, items: Vec<(String, String)>) -> StorageFuture<'_, ()> {
      self.writes.lock().unwrap().push(Instant::now());
      self.inner.set(items)
    }

    fn remove(&self, key: String) -> StorageFuture<'_, ()> {
      self.inner.remove(key)
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
      self.inner.changes()
    }
  }

  fn options(buster: &str) -> PersistOptions {
    PersistOptions {
      buster: buster.to_string(),
      ..PersistOptions::default()
    }
  }

  fn cache(clock: &ManualClock) -> QueryCache {
    QueryCache::with_clock(CacheConfig::default(), Arc::new(clock.clone()))
  }

  async fn stored(store: &KvStore) -> Option<PersistedCache> {
    let raw = store.get(CACHE_KEY).await.unwrap()?;
    Some(serde_json::from_str(&raw).unwrap())
  }

  #[tokio::test(start_paused = true)]
  async fn test_burst_is_written_once_with_final_state() {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let store = KvStore::new(CountingBackend {
      inner: MemoryBackend::new(),
      writes: writes.clone(),
    });
    let clock = ManualClock::default();
    let cache = cache(&clock);
    let handle = CachePersister::new(store.clone(), cache.clone(), options("1")).spawn();

    for i in 0..10u32 {
      cache
        .set_query_data(&format!("k{}", i), &i, QueryOptions::default())
        .unwrap();
      tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(writes.lock().unwrap().len(), 0);

    tokio::time::sleep(std::time::Duration::from_millis(700)).await;
    assert_eq!(writes.lock().unwrap().len(), 1);
    assert_eq!(stored(&store).await.unwrap().entries.len(), 10);

    handle.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_steady_stream_is_written_once_per_interval() {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let store = KvStore::new(CountingBackend {
      inner: MemoryBackend::new(),
      writes: writes.clone(),
    });
    let clock = ManualClock::default();
    let cache = cache(&clock);
    let handle = CachePersister::new(store.clone(), cache.clone(), options("1")).spawn();

    // One mutation every 50 ms for 3.5 s
    for i in 0..70u32 {
      cache
        .set_query_data(&format!("k{}", i), &i, QueryOptions::default())
        .unwrap();
      tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let times = writes.lock().unwrap().clone();
    assert!((3..=5).contains(&times.len()), "{} writes", times.len());
    for pair in times.windows(2) {
      assert!(pair[1] - pair[0] >= DEFAULT_THROTTLE);
    }
    let last = stored(&store).await.unwrap();
    assert!(last.entries.contains_key("k69"));
    assert_eq!(last.entries.len(), 70);

    handle.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_own_late_echo_does_not_restore_invalidated_entry() {
    let store = KvStore::new(MemoryBackend::new());
    let cache = QueryCache::default();
    let handle = CachePersister::new(store.clone(), cache.clone(), options("1")).spawn();

    for i in 0..300u32 {
      cache.set_query_data("k", &i, QueryOptions::default()).unwrap();
      handle.flush().await;
      cache.invalidate("k");
      handle.flush().await;
      assert!(cache.entry("k").is_none(), "round {}", i);
    }

    // Let any echo still being routed arrive
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(cache.entry("k").is_none());

    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_own_echoes_are_recognized_out_of_step() {
    let store = KvStore::new(MemoryBackend::new());
    let cache = QueryCache::default();
    let persister = CachePersister::new(store.clone(), cache.clone(), options("1"));

    cache.set_query_data("k", &1u32, QueryOptions::default()).unwrap();
    persister.persist().await.unwrap();
    let first = store.get(CACHE_KEY).await.unwrap();
    cache.clear();
    persister.persist().await.unwrap();

    // The first write's echo shows up after the second write
    persister.apply_external(first);
    assert!(cache.entry("k").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_flushes_pending_write() {
    let store = KvStore::new(MemoryBackend::new());
    let clock = ManualClock::default();
    let cache = cache(&clock);
    let handle = CachePersister::new(store.clone(), cache.clone(), options("1")).spawn();

    cache
      .set_query_data("me", &"account", QueryOptions::default())
      .unwrap();
    tokio::task::yield_now().await;
    handle.shutdown().await;

    assert!(stored(&store).await.unwrap().entries.contains_key("me"));
  }

  #[tokio::test]
  async fn test_round_trip_preserves_entries() {
    let store = KvStore::new(MemoryBackend::new());
    let clock = ManualClock::default();
    let original = cache(&clock);
    original
      .set_query_data("my_account", &serde_json::json!({"id": 1, "login": "jdoe"}), QueryOptions::default())
      .unwrap();
    clock.advance(Duration::milliseconds(1234));
    original
      .set_query_data("issues:assigned", &vec![1, 2, 3], QueryOptions::default())
      .unwrap();
    CachePersister::new(store.clone(), original.clone(), options("1"))
      .persist()
      .await
      .unwrap();

    let restored = cache(&clock);
    let outcome = CachePersister::new(store.clone(), restored.clone(), options("1"))
      .restore()
      .await;

    assert_eq!(outcome, RestoreOutcome::Restored(2));
    assert_eq!(restored.snapshot(), original.snapshot());
  }

  #[tokio::test]
  async fn test_buster_mismatch_discards_everything() {
    let store = KvStore::new(MemoryBackend::new());
    let clock = ManualClock::default();
    let old = cache(&clock);
    old.set_query_data("x", &1u32, QueryOptions::default()).unwrap();
    CachePersister::new(store.clone(), old, options("1.0.0"))
      .persist()
      .await
      .unwrap();

    let fresh = cache(&clock);
    let outcome = CachePersister::new(store.clone(), fresh.clone(), options("1.0.1"))
      .restore()
      .await;

    assert_eq!(
      outcome,
      RestoreOutcome::BusterMismatch {
        stored: "1.0.0".to_string()
      }
    );
    assert!(fresh.is_empty());
    assert_eq!(store.get(CACHE_KEY).await.unwrap(), None);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    fresh
      .get("x", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, String>(2u32) }
      })
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_expired_snapshot_is_discarded() {
    let store = KvStore::new(MemoryBackend::new());
    let clock = ManualClock::default();
    let old = cache(&clock);
    old.set_query_data("x", &1u32, QueryOptions::default()).unwrap();
    CachePersister::new(store.clone(), old, options("1"))
      .persist()
      .await
      .unwrap();

    clock.advance(Duration::hours(25));
    let fresh = cache(&clock);
    let outcome = CachePersister::new(store.clone(), fresh.clone(), options("1"))
      .restore()
      .await;

    assert_eq!(outcome, RestoreOutcome::Expired);
    assert!(fresh.is_empty());
  }

  #[tokio::test]
  async fn test_old_entries_are_dropped_from_young_snapshot() {
    let store = KvStore::new(MemoryBackend::new());
    let clock = ManualClock::default();
    let original = cache(&clock);
    original
      .set_query_data(
        "short",
        &1u32,
        QueryOptions::default().max_persist_age(Duration::minutes(1)),
      )
      .unwrap();
    original.set_query_data("long", &2u32, QueryOptions::default()).unwrap();
    clock.advance(Duration::minutes(5));
    CachePersister::new(store.clone(), original, options("1"))
      .persist()
      .await
      .unwrap();

    let restored = cache(&clock);
    let outcome = CachePersister::new(store, restored.clone(), options("1"))
      .restore()
      .await;

    assert_eq!(outcome, RestoreOutcome::Restored(1));
    assert!(restored.entry("long").is_some());
  }

  #[tokio::test]
  async fn test_corrupt_snapshot_is_discarded() {
    let store = KvStore::new(MemoryBackend::new());
    store.set(CACHE_KEY, "][".to_string()).await.unwrap();
    let fresh = QueryCache::default();

    let outcome = CachePersister::new(store.clone(), fresh, options("1"))
      .restore()
      .await;
    assert_eq!(outcome, RestoreOutcome::Corrupt);
    assert_eq!(store.get(CACHE_KEY).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_unavailable_storage_degrades_to_memory() {
    let backend = MemoryBackend::new();
    let store = KvStore::new(backend.clone());
    backend.set_available(false);
    let cache = QueryCache::default();
    let persister = CachePersister::new(store, cache.clone(), options("1"));

    assert_eq!(persister.restore().await, RestoreOutcome::Unavailable);
    cache.set_query_data("x", &1u32, QueryOptions::default()).unwrap();
    assert!(persister.persist().await.is_err());
    persister.persist_logged().await;
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn test_other_context_rehydrates() {
    let service = MemoryService::new();
    let clock = ManualClock::default();
    let popup_cache = cache(&clock);
    let popout_cache = cache(&clock);
    let popup = CachePersister::new(
      KvStore::new(service.connect()),
      popup_cache.clone(),
      options("1"),
    )
    .spawn();
    let popout = CachePersister::new(
      KvStore::new(service.connect()),
      popout_cache.clone(),
      options("1"),
    )
    .spawn();

    popup_cache
      .set_query_data("my_account", &"jdoe", QueryOptions::default())
      .unwrap();
    popup.flush().await;

    let deadline = Instant::now() + std::time::Duration::from_secs(2);
    while popout_cache.entry("my_account").is_none() && Instant::now() < deadline {
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(
      popout_cache.entry("my_account").map(|e| e.data),
      Some(serde_json::json!("jdoe"))
    );

    popup.shutdown().await;
    popout.shutdown().await;
  }
}
