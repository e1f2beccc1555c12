//! Query cache and its durable mirror.
//!
//! - [`QueryCache`] keeps fetched results in memory with staleness and
//!   garbage-collection windows, and deduplicates concurrent fetches per key.
//! - [`CachePersister`] writes throttled snapshots of the cache to storage,
//!   restores them at startup and merges snapshots written by other contexts.

mod manager;
mod persister;
mod traits;

pub use manager::{
  CacheConfig, CacheEntry, CacheEvent, QueryCache, QueryOptions, RefetchPolicy, DEFAULT_GC_SECS,
  DEFAULT_STALE_SECS,
};
pub use persister::{
  CachePersister, PersistOptions, PersistedCache, PersisterHandle, RestoreOutcome, CACHE_KEY,
  DEFAULT_MAX_AGE_SECS, DEFAULT_THROTTLE,
};
pub use traits::{CacheResult, CacheSource, QueryKey};
