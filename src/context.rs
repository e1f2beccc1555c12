//! Process-scoped state of one context.
//!
//! `ExtensionContext::init` restores the persisted cache before anything can
//! read it; `shutdown` writes whatever is still pending. A context that is
//! torn down without `shutdown` may lose writes queued in the last throttle
//! interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{
  CacheConfig, CachePersister, PersistOptions, PersisterHandle, QueryCache, RestoreOutcome,
};
use crate::clock::{Clock, SystemClock};
use crate::settings::{Settings, SettingsError, SettingsStore};
use crate::storage::KvStore;

/// Default interval between garbage-collection sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ContextOptions {
  pub cache: CacheConfig,
  pub persist: PersistOptions,
  pub gc_interval: Duration,
}

impl Default for ContextOptions {
  fn default() -> Self {
    Self {
      cache: CacheConfig::default(),
      persist: PersistOptions::default(),
      gc_interval: DEFAULT_GC_INTERVAL,
    }
  }
}

/// Settings, query cache and persister of one context.
pub struct ExtensionContext {
  store: KvStore,
  settings: SettingsStore,
  cache: QueryCache,
  persister: PersisterHandle,
  gc: SweepTask,
  restored: RestoreOutcome,
}

impl ExtensionContext {
  pub async fn init(store: KvStore, options: ContextOptions) -> Self {
    Self::init_with_clock(store, options, Arc::new(SystemClock)).await
  }

  pub async fn init_with_clock(
    store: KvStore,
    options: ContextOptions,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let cache = QueryCache::with_clock(options.cache, clock);
    let persister = CachePersister::new(store.clone(), cache.clone(), options.persist);
    let restored = persister.restore().await;
    info!(?restored, "query cache ready");

    let gc = SweepTask(tokio::spawn(collect_garbage(cache.clone(), options.gc_interval)));

    Self {
      settings: SettingsStore::open(store.clone()),
      store,
      cache,
      persister: persister.spawn(),
      gc,
      restored,
    }
  }

  pub fn store(&self) -> &KvStore {
    &self.store
  }

  pub fn settings(&self) -> &SettingsStore {
    &self.settings
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// How the persisted cache was handled at startup.
  pub fn restored(&self) -> &RestoreOutcome {
    &self.restored
  }

  /// Validate and save settings, then drop every cached query.
  ///
  /// Cached data belonged to the previous endpoint or credential.
  pub fn save_settings(&self, settings: &Settings) -> Result<(), Vec<SettingsError>> {
    settings.validate()?;
    self.settings.write(settings);
    self.cache.clear();
    Ok(())
  }

  /// Write everything still pending without stopping.
  pub async fn flush(&self) {
    self.settings.flush().await;
    self.persister.flush().await;
  }

  /// Write everything still pending and stop background work.
  pub async fn shutdown(self) {
    self.settings.flush().await;
    drop(self.gc);
    self.persister.shutdown().await;
    debug!("context shut down");
  }
}

/// The periodic garbage-collection sweep; stops when dropped.
struct SweepTask(JoinHandle<()>);

impl Drop for SweepTask {
  fn drop(&mut self) {
    self.0.abort();
  }
}

async fn collect_garbage(cache: QueryCache, every: Duration) {
  let mut ticker = tokio::time::interval(every);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    cache.garbage_collect(cache.now());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryOptions;
  use crate::clock::ManualClock;
  use crate::storage::MemoryService;

  fn options(buster: &str) -> ContextOptions {
    ContextOptions {
      persist: PersistOptions {
        buster: buster.to_string(),
        ..PersistOptions::default()
      },
      ..ContextOptions::default()
    }
  }

  #[tokio::test]
  async fn test_restart_restores_cache() {
    let service = MemoryService::new();

    let first = ExtensionContext::init(KvStore::new(service.connect()), options("1")).await;
    assert_eq!(first.restored(), &RestoreOutcome::Empty);
    first
      .cache()
      .set_query_data("my_account", &"jdoe", QueryOptions::default())
      .unwrap();
    first.shutdown().await;

    let second = ExtensionContext::init(KvStore::new(service.connect()), options("1")).await;
    assert_eq!(second.restored(), &RestoreOutcome::Restored(1));
    second.shutdown().await;
  }

  #[tokio::test]
  async fn test_save_settings_validates_and_clears_cache() {
    let context = ExtensionContext::init(KvStore::new(MemoryService::new().connect()), options("1")).await;
    context
      .cache()
      .set_query_data("my_account", &"jdoe", QueryOptions::default())
      .unwrap();

    assert!(context.save_settings(&Settings::default()).is_err());
    assert_eq!(context.cache().len(), 1);

    let settings = Settings {
      redmine_url: "https://redmine.example.com".to_string(),
      redmine_api_key: "key".to_string(),
      ..Settings::default()
    };
    context.save_settings(&settings).unwrap();
    assert!(context.cache().is_empty());
    assert_eq!(context.settings().read().await, settings);

    context.shutdown().await;
  }

  fn sweeping_every_second() -> ContextOptions {
    ContextOptions {
      gc_interval: Duration::from_secs(1),
      ..options("1")
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_sweep_evicts_expired_entries() {
    let clock = ManualClock::default();
    let context = ExtensionContext::init_with_clock(
      KvStore::new(MemoryService::new().connect()),
      sweeping_every_second(),
      Arc::new(clock.clone()),
    )
    .await;
    let short = QueryOptions::default().gc_time(chrono::Duration::minutes(5));
    context.cache().set_query_data("old", &1u32, short).unwrap();

    clock.advance(chrono::Duration::minutes(6));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(context.cache().entry("old").is_none());

    context.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_context_stops_sweeping() {
    let clock = ManualClock::default();
    let context = ExtensionContext::init_with_clock(
      KvStore::new(MemoryService::new().connect()),
      sweeping_every_second(),
      Arc::new(clock.clone()),
    )
    .await;
    let cache = context.cache().clone();
    drop(context);

    let short = QueryOptions::default().gc_time(chrono::Duration::minutes(5));
    cache.set_query_data("old", &1u32, short).unwrap();
    clock.advance(chrono::Duration::minutes(6));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(cache.entry("old").is_some());
  }
}
