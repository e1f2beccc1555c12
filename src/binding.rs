//! Typed, reactive access to one storage key.
//!
//! A [`StorageBinding`] serializes a value as JSON under a key. Every context
//! builds its own replica of the value from the stored text and keeps it
//! current by listening to change events; there is no shared in-process object.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::storage::{ChangeEvent, KvStore, ListenerId};

/// Values that can live behind a binding.
pub trait Persistable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Persistable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

enum WriteOp {
  Set(String),
  Remove,
}

struct BindingInner<T> {
  store: KvStore,
  key: String,
  default: T,
  writes: mpsc::UnboundedSender<WriteOp>,
  /// Number of queued writes not yet applied
  pending: watch::Sender<usize>,
}

/// Typed accessor for the value stored under one key.
pub struct StorageBinding<T> {
  inner: Arc<BindingInner<T>>,
}

impl<T> Clone for StorageBinding<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Persistable> StorageBinding<T> {
  /// Create a binding for `key`. Must be called inside a tokio runtime.
  pub fn new(store: KvStore, key: impl Into<String>, default: T) -> Self {
    let key = key.into();
    let (writes, rx) = mpsc::unbounded_channel();
    let (pending, _) = watch::channel(0usize);
    let pending_tx = pending.clone();

    tokio::spawn(apply_writes(store.clone(), key.clone(), rx, pending_tx));

    Self {
      inner: Arc::new(BindingInner {
        store,
        key,
        default,
        writes,
        pending,
      }),
    }
  }

  pub fn key(&self) -> &str {
    &self.inner.key
  }

  pub fn default_value(&self) -> &T {
    &self.inner.default
  }

  /// Current value, or the default when it is absent or unreadable.
  ///
  /// Never fails: storage and decoding problems are logged and replaced by the default.
  pub async fn read(&self) -> T {
    match self.try_read().await {
      Ok(Some(value)) => value,
      Ok(None) => self.inner.default.clone(),
      Err(e) => {
        warn!(key = %self.inner.key, error = %e, "using default value");
        self.inner.default.clone()
      }
    }
  }

  /// Current value without fallback. `None` means nothing is stored.
  pub async fn try_read(&self) -> StateResult<Option<T>> {
    // Our own queued writes must be visible to our reads
    self.flush().await;
    let raw = self.inner.store.get(&self.inner.key).await?;
    raw.map(|r| decode(&self.inner.key, &r)).transpose()
  }

  /// Queue `value` for writing and return immediately.
  pub fn write(&self, value: &T) {
    match serde_json::to_string(value) {
      Ok(raw) => self.enqueue(WriteOp::Set(raw)),
      Err(e) => warn!(key = %self.inner.key, error = %e, "dropping unserializable value"),
    }
  }

  /// Queue removal of the stored value; readers fall back to the default.
  pub fn reset(&self) {
    self.enqueue(WriteOp::Remove);
  }

  fn enqueue(&self, op: WriteOp) {
    self.inner.pending.send_modify(|n| *n += 1);
    if self.inner.writes.send(op).is_err() {
      // Writer task is gone (runtime shutting down)
      self.inner.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
  }

  /// Wait until every queued write has been handed to the store.
  pub async fn flush(&self) {
    let mut pending = self.inner.pending.subscribe();
    let _ = pending.wait_for(|n| *n == 0).await;
  }

  /// Call `on_change` with the new value every time the key changes in any context.
  ///
  /// Redundant notifications carrying the value last delivered are skipped.
  pub fn subscribe<F>(&self, on_change: F) -> Subscription
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    let key = self.inner.key.clone();
    let default = self.inner.default.clone();
    let last_raw: Mutex<Option<Option<String>>> = Mutex::new(None);

    let listener = Arc::new(move |event: &ChangeEvent| {
      {
        let mut last = last_raw.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_ref() == Some(&event.new_value) {
          debug!(key = %key, "ignoring redundant change");
          return;
        }
        *last = Some(event.new_value.clone());
      }

      let value = match &event.new_value {
        Some(raw) => decode(&key, raw).unwrap_or_else(|e| {
          warn!(key = %key, error = %e, "using default value");
          default.clone()
        }),
        None => default.clone(),
      };
      on_change(value);
    });

    let id = self.inner.store.on_change(&self.inner.key, listener);
    Subscription {
      store: self.inner.store.clone(),
      key: self.inner.key.clone(),
      id,
      active: AtomicBool::new(true),
    }
  }

  /// A live replica of the value: `Loading`, then `Loaded` and kept current.
  pub fn live(&self) -> LiveValue<T> {
    let (state, rx) = watch::channel(LoadState::Loading);
    let state = Arc::new(state);

    // Subscribe before the initial read so no change can slip in between
    let on_change = Arc::clone(&state);
    let subscription = self.subscribe(move |value| {
      on_change.send_replace(LoadState::Loaded(value));
    });

    let binding = self.clone();
    tokio::spawn(async move {
      let value = binding.read().await;
      // A change delivered meanwhile is newer than what we just read
      state.send_if_modified(|current| match current {
        LoadState::Loading => {
          *current = LoadState::Loaded(value);
          true
        }
        LoadState::Loaded(_) => false,
      });
    });

    LiveValue {
      binding: self.clone(),
      state: rx,
      _subscription: subscription,
    }
  }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StateResult<T> {
  serde_json::from_str(raw).map_err(|source| StateError::Deserialization {
    key: key.to_string(),
    source,
  })
}

/// Apply one binding's writes in the order they were queued.
async fn apply_writes(
  store: KvStore,
  key: String,
  mut rx: mpsc::UnboundedReceiver<WriteOp>,
  pending: watch::Sender<usize>,
) {
  while let Some(op) = rx.recv().await {
    let result = match op {
      WriteOp::Set(raw) => store.set(&key, raw).await,
      WriteOp::Remove => store.remove(&key).await,
    };
    if let Err(e) = result {
      warn!(key = %key, error = %e, "write not persisted");
    }
    pending.send_modify(|n| *n = n.saturating_sub(1));
  }
}

/// Registration of a change callback. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
  store: KvStore,
  key: String,
  id: ListenerId,
  active: AtomicBool,
}

impl Subscription {
  /// Stop receiving changes. Safe to call more than once.
  pub fn unsubscribe(&self) {
    if self.active.swap(false, Ordering::SeqCst) {
      self.store.off_change(&self.key, self.id);
    }
  }

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::SeqCst)
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

/// Load state of a [`LiveValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<T> {
  Loading,
  Loaded(T),
}

/// Reactive replica of a binding's value for one consumer.
pub struct LiveValue<T> {
  binding: StorageBinding<T>,
  state: watch::Receiver<LoadState<T>>,
  _subscription: Subscription,
}

impl<T: Persistable> LiveValue<T> {
  /// The loaded value, or the default while still loading.
  pub fn value(&self) -> T {
    match &*self.state.borrow() {
      LoadState::Loaded(value) => value.clone(),
      LoadState::Loading => self.binding.default_value().clone(),
    }
  }

  pub fn state(&self) -> LoadState<T> {
    self.state.borrow().clone()
  }

  pub fn is_loading(&self) -> bool {
    matches!(*self.state.borrow(), LoadState::Loading)
  }

  pub fn set_value(&self, value: &T) {
    self.binding.write(value);
  }

  /// Wait for the next update. Returns `false` once no more updates can arrive.
  pub async fn changed(&mut self) -> bool {
    self.state.changed().await.is_ok()
  }

  /// Wait until a loaded value satisfies `predicate` and return it.
  pub async fn wait_until<F>(&mut self, mut predicate: F) -> Option<T>
  where
    F: FnMut(&T) -> bool,
  {
    let state = self
      .state
      .wait_for(|s| matches!(s, LoadState::Loaded(v) if predicate(v)))
      .await
      .ok()?;
    match &*state {
      LoadState::Loaded(value) => Some(value.clone()),
      LoadState::Loading => None,
    }
  }
}
