//! Durable key-value storage shared by every context.
//!
//! A [`StorageBackend`] is the raw platform service: text values under string
//! keys plus a change feed. [`KvStore`] is the adapter the rest of the crate
//! talks to; it adds per-key listener routing on top of a backend.
//!
//! Backends echo a context's own writes back on its change feed, so a listener
//! can see the same change more than once and must be idempotent.

mod memory;
mod sqlite;
mod store;

pub use memory::{MemoryBackend, MemoryService};
pub use sqlite::SqliteBackend;
pub use store::{KvStore, Listener, ListenerId};

use futures::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::error::StorageError;

/// Boxed future returned by backend operations.
pub type StorageFuture<'a, T> = BoxFuture<'a, Result<T, StorageError>>;

/// Capacity of backend change feeds.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 256;

/// A change of one key, as seen by every context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub key: String,
  pub old_value: Option<String>,
  pub new_value: Option<String>,
}

/// The platform storage service consumed by [`KvStore`].
pub trait StorageBackend: Send + Sync {
  /// Read several keys at once. Missing keys are absent from the result.
  fn get(&self, keys: Vec<String>) -> StorageFuture<'_, HashMap<String, String>>;

  /// Write several keys. Resolves once the values are durably accepted.
  fn set(&self, items: Vec<(String, String)>) -> StorageFuture<'_, ()>;

  /// Remove a key. Removing a missing key succeeds.
  fn remove(&self, key: String) -> StorageFuture<'_, ()>;

  /// Subscribe to changes made by any context, this one included.
  fn changes(&self) -> broadcast::Receiver<ChangeEvent>;
}
