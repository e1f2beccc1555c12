//! Error taxonomy for the shared-state layer.
//!
//! Storage and deserialization failures are recovered at the binding and
//! persister boundaries; only `Remote` is meant to reach UI code.

use thiserror::Error;

/// Failure of the underlying durable store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
  /// The store cannot be reached right now (closed context, locked file, ...).
  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Unavailable(e.to_string())
  }
}

/// A fetcher supplied by the caller failed.
///
/// Cloneable so that every caller sharing a single in-flight fetch gets the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("remote request failed: {0}")]
pub struct RemoteError(pub String);

impl RemoteError {
  pub fn new(message: impl std::fmt::Display) -> Self {
    Self(message.to_string())
  }
}

/// Errors surfaced by typed bindings and the query cache.
#[derive(Debug, Error)]
pub enum StateError {
  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error("failed to deserialize value stored under '{key}': {source}")]
  Deserialization {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize value: {0}")]
  Serialization(#[source] serde_json::Error),

  #[error(transparent)]
  Remote(#[from] RemoteError),
}

impl StateError {
  /// True for failures the caller should show as an error state (retry affordance).
  pub fn is_remote(&self) -> bool {
    matches!(self, StateError::Remote(_))
  }
}

pub type StateResult<T> = Result<T, StateError>;
