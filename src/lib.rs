//! Shared settings and a persistent query cache for a Redmine time tracker.
//!
//! Every context (popup, options page, background worker, CLI) opens the same
//! [`storage::KvStore`] and sees each other's writes. Settings live under one
//! key behind [`settings::SettingsStore`]; remote query results live in a
//! [`cache::QueryCache`] mirrored to storage by [`cache::CachePersister`].

pub mod binding;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod queries;
pub mod query;
pub mod settings;
pub mod storage;

pub use context::{ContextOptions, ExtensionContext};
pub use error::{RemoteError, StateError, StateResult, StorageError};
