//! Key-value adapter with per-key change listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ChangeEvent, StorageBackend};
use crate::error::StorageError;

/// Callback invoked with every change of the key it is registered for.
///
/// Listeners run on the adapter's routing task and must not block.
pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by [`KvStore::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
  listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

impl Registry {
  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<(ListenerId, Listener)>>> {
    self.listeners.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn dispatch(&self, event: &ChangeEvent) {
    // Snapshot so listeners may (un)register from inside the callback
    let listeners: Vec<Listener> = match self.lock().get(&event.key) {
      Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
      None => return,
    };
    for listener in listeners {
      listener(event);
    }
  }
}

struct Inner {
  backend: Arc<dyn StorageBackend>,
  registry: Arc<Registry>,
  next_id: AtomicU64,
  router: JoinHandle<()>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    self.router.abort();
  }
}

/// The durable key-value store as seen by one context.
///
/// Cheap to clone; clones share the listener registry.
#[derive(Clone)]
pub struct KvStore {
  inner: Arc<Inner>,
}

impl KvStore {
  /// Wrap a backend. Must be called inside a tokio runtime.
  pub fn new(backend: impl StorageBackend + 'static) -> Self {
    Self::from_arc(Arc::new(backend))
  }

  pub fn from_arc(backend: Arc<dyn StorageBackend>) -> Self {
    let registry = Arc::new(Registry::default());
    let router = tokio::spawn(route_changes(backend.changes(), Arc::clone(&registry)));

    Self {
      inner: Arc::new(Inner {
        backend,
        registry,
        next_id: AtomicU64::new(0),
        router,
      }),
    }
  }

  /// Raw value under `key`, `None` when absent.
  pub async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let mut found = self.inner.backend.get(vec![key.to_string()]).await?;
    Ok(found.remove(key))
  }

  pub async fn set(&self, key: &str, raw: String) -> Result<(), StorageError> {
    self.inner.backend.set(vec![(key.to_string(), raw)]).await
  }

  pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
    self.inner.backend.remove(key.to_string()).await
  }

  /// Register `listener` for changes of `key`.
  pub fn on_change(&self, key: &str, listener: Listener) -> ListenerId {
    let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .inner
      .registry
      .lock()
      .entry(key.to_string())
      .or_default()
      .push((id, listener));
    id
  }

  /// Unregister a listener. Unknown ids are ignored.
  pub fn off_change(&self, key: &str, id: ListenerId) {
    let mut listeners = self.inner.registry.lock();
    if let Some(list) = listeners.get_mut(key) {
      list.retain(|(existing, _)| *existing != id);
      if list.is_empty() {
        listeners.remove(key);
      }
    }
  }

  /// Number of listeners registered for `key`.
  pub fn listener_count(&self, key: &str) -> usize {
    self.inner.registry.lock().get(key).map_or(0, Vec::len)
  }
}

async fn route_changes(mut feed: broadcast::Receiver<ChangeEvent>, registry: Arc<Registry>) {
  loop {
    match feed.recv().await {
      Ok(event) => {
        debug!(key = %event.key, "storage change");
        registry.dispatch(&event);
      }
      Err(broadcast::error::RecvError::Lagged(missed)) => {
        warn!(missed, "storage change feed lagged; some replicas may be stale");
      }
      Err(broadcast::error::RecvError::Closed) => break,
    }
  }
}
