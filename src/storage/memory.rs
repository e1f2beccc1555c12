//! In-process storage service with several context handles.

use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{ChangeEvent, StorageBackend, StorageFuture, CHANGE_FEED_CAPACITY};
use crate::error::StorageError;

struct ServiceInner {
  data: Mutex<HashMap<String, String>>,
  changes: broadcast::Sender<ChangeEvent>,
}

/// A storage service living in this process.
///
/// Each [`MemoryService::connect`] call hands out the backend for one more
/// context. All contexts share the data and the change feed.
#[derive(Clone)]
pub struct MemoryService {
  inner: Arc<ServiceInner>,
}

impl MemoryService {
  pub fn new() -> Self {
    let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
    Self {
      inner: Arc::new(ServiceInner {
        data: Mutex::new(HashMap::new()),
        changes,
      }),
    }
  }

  /// Backend for a new context.
  pub fn connect(&self) -> MemoryBackend {
    MemoryBackend {
      service: Arc::clone(&self.inner),
      available: Arc::new(AtomicBool::new(true)),
    }
  }

  /// Raw value currently stored under `key`.
  pub fn raw(&self, key: &str) -> Option<String> {
    lock_data(&self.inner).get(key).cloned()
  }
}

impl Default for MemoryService {
  fn default() -> Self {
    Self::new()
  }
}

fn lock_data(inner: &ServiceInner) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
  inner.data.lock().unwrap_or_else(|e| e.into_inner())
}

/// One context's connection to a [`MemoryService`].
#[derive(Clone)]
pub struct MemoryBackend {
  service: Arc<ServiceInner>,
  available: Arc<AtomicBool>,
}

impl MemoryBackend {
  /// A backend on a fresh private service.
  pub fn new() -> Self {
    MemoryService::new().connect()
  }

  /// Simulate the context losing (or regaining) access to storage.
  pub fn set_available(&self, available: bool) {
    self.available.store(available, Ordering::SeqCst);
  }

  fn check_available(&self) -> Result<(), StorageError> {
    if self.available.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(StorageError::Unavailable(
        "extension context invalidated".to_string(),
      ))
    }
  }

  fn publish(&self, events: Vec<ChangeEvent>) {
    for event in events {
      // No receivers is fine
      let _ = self.service.changes.send(event);
    }
  }
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl StorageBackend for MemoryBackend {
  fn get(&self, keys: Vec<String>) -> StorageFuture<'_, HashMap<String, String>> {
    async move {
      self.check_available()?;
      let data = lock_data(&self.service);
      Ok(
        keys
          .into_iter()
          .filter_map(|k| data.get(&k).cloned().map(|v| (k, v)))
          .collect(),
      )
    }
    .boxed()
  }

  fn set(&self, items: Vec<(String, String)>) -> StorageFuture<'_, ()> {
    async move {
      self.check_available()?;
      let events = {
        let mut data = lock_data(&self.service);
        let mut events = Vec::new();
        for (key, value) in items {
          let old_value = data.insert(key.clone(), value.clone());
          if old_value.as_deref() != Some(value.as_str()) {
            events.push(ChangeEvent {
              key,
              old_value,
              new_value: Some(value),
            });
          }
        }
        events
      };
      self.publish(events);
      Ok(())
    }
    .boxed()
  }

  fn remove(&self, key: String) -> StorageFuture<'_, ()> {
    async move {
      self.check_available()?;
      let old_value = lock_data(&self.service).remove(&key);
      if old_value.is_some() {
        self.publish(vec![ChangeEvent {
          key,
          old_value,
          new_value: None,
        }]);
      }
      Ok(())
    }
    .boxed()
  }

  fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
    self.service.changes.subscribe()
  }
}
