//! Async query abstraction over the shared [`QueryCache`].
//!
//! Inspired by TanStack Query, a `CachedQuery<T>` encapsulates one remote
//! query as seen by one consumer: its loading, success and error states, and
//! the cache key it reads through.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let mut query = CachedQuery::new(cache.clone(), &RedmineQuery::MyAccount, move || {
//!     let api = api.clone();
//!     async move { api.my_account().await.map_err(|e| e.to_string()) }
//! });
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_retry(e),
//!     QueryState::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{QueryCache, QueryKey, QueryOptions};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync>;

/// Outcome of one fetch: the data and when the cache got it
type Outcome<T> = Result<(T, Option<DateTime<Utc>>), String>;

/// One consumer's view of a cached remote query.
pub struct CachedQuery<T> {
  state: QueryState<T>,
  cache: QueryCache,
  key: String,
  options: QueryOptions,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Outcome<T>>>,
  /// `fetched_at` of the cache entry currently shown
  fetched_at: Option<DateTime<Utc>>,
}

impl<T> CachedQuery<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
  /// Create a new query reading `key` through `cache`.
  ///
  /// The fetcher is called whenever the cache has no fresh entry and no
  /// other consumer is already fetching the same key.
  pub fn new<K, F, Fut>(cache: QueryCache, key: &K, fetcher: F) -> Self
  where
    K: QueryKey + ?Sized,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      cache,
      key: key.cache_key(),
      options: QueryOptions::default(),
      fetcher: Arc::new(move || fetcher().boxed()),
      receiver: None,
      fetched_at: None,
    }
  }

  /// Override the cache options for this query.
  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the data if the query succeeded.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Check if the cached data is stale (or gone).
  pub fn is_stale(&self) -> bool {
    let now = self.cache.now();
    self
      .cache
      .entry(self.key.as_str())
      .map_or(true, |entry| !entry.is_fresh(now))
  }

  /// Start fetching data if not already loading.
  ///
  /// Served from the cache without a request when the entry is fresh.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Drop the cached entry and fetch again.
  pub fn refetch(&mut self) {
    self.cache.invalidate(self.key.as_str());
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch, or for newer data another
  /// consumer or context put in the cache.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return self.follow_cache(),
    };

    match receiver.try_recv() {
      Ok(Ok((data, fetched_at))) => {
        self.state = QueryState::Success(data);
        self.fetched_at = fetched_at;
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.state = QueryState::Error("Query was cancelled".to_string());
        self.receiver = None;
        true
      }
    }
  }

  /// Wait for the pending fetch to settle. Returns `true` if the state changed.
  pub async fn settle(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };
    let outcome = receiver.recv().await;
    self.receiver = None;
    match outcome {
      Some(Ok((data, fetched_at))) => {
        self.state = QueryState::Success(data);
        self.fetched_at = fetched_at;
      }
      Some(Err(error)) => self.state = QueryState::Error(error),
      None => self.state = QueryState::Error("Query was cancelled".to_string()),
    }
    true
  }

  /// Pick up a newer cache entry for our key.
  fn follow_cache(&mut self) -> bool {
    if !self.state.is_success() {
      return false;
    }
    let Some(entry) = self.cache.entry(self.key.as_str()) else {
      return false;
    };
    if self.fetched_at.is_some_and(|shown| shown >= entry.fetched_at) {
      return false;
    }
    match serde_json::from_value(entry.data) {
      Ok(data) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(entry.fetched_at);
        true
      }
      Err(_) => false,
    }
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let cache = self.cache.clone();
    let key = self.key.clone();
    let options = self.options;
    let fetcher = Arc::clone(&self.fetcher);

    tokio::spawn(async move {
      let result = cache
        .get_with(key.as_str(), options, move || fetcher())
        .await
        .map(|result| {
          let fetched_at = cache.entry(key.as_str()).map(|e| e.fetched_at);
          (result.data, result.cached_at.or(fetched_at))
        })
        .map_err(|e| e.to_string());
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CachedQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CachedQuery")
      .field("state", &self.state)
      .field("key", &self.key)
      .field("fetched_at", &self.fetched_at)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheConfig;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_query_success() {
    let cache = QueryCache::default();
    let mut query = CachedQuery::new(cache, "numbers", || async { Ok::<_, String>(vec![1, 2, 3]) });

    assert!(matches!(query.state(), QueryState::Idle));

    query.fetch();
    assert!(query.is_loading());

    // Wait for the result
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_success());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_query_error() {
    let cache = QueryCache::default();
    let mut query: CachedQuery<i32> =
      CachedQuery::new(cache, "broken", || async { Err("Something went wrong".to_string()) });

    query.fetch();
    assert!(query.settle().await);

    assert!(query.is_error());
    assert_eq!(
      query.error(),
      Some("remote request failed: Something went wrong")
    );
  }

  #[tokio::test]
  async fn test_query_stale() {
    let cache = QueryCache::default();
    let mut query = CachedQuery::new(cache, "answer", || async { Ok::<_, String>(42) })
      .with_options(QueryOptions::default().stale_time(chrono::Duration::zero()));

    query.fetch();
    query.settle().await;

    // With zero stale time, should immediately be stale
    assert!(query.is_stale());
  }

  #[tokio::test]
  async fn test_fetch_while_loading_is_noop() {
    let cache = QueryCache::default();
    let mut query = CachedQuery::new(cache, "slow", || async {
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok::<_, String>(42)
    });

    query.fetch();
    assert!(query.is_loading());

    // Second fetch should be no-op
    query.fetch();
    assert!(query.is_loading());
  }

  #[tokio::test]
  async fn test_consumers_share_cache() {
    let cache = QueryCache::new(CacheConfig::default());
    let counter = Arc::new(AtomicU32::new(0));
    let make = |cache: QueryCache, counter: Arc<AtomicU32>| {
      CachedQuery::new(cache, "me", move || {
        let counter = counter.clone();
        async move { Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst)) }
      })
    };

    let mut popup = make(cache.clone(), counter.clone());
    let mut options_page = make(cache.clone(), counter.clone());

    popup.fetch();
    popup.settle().await;
    options_page.fetch();
    options_page.settle().await;

    assert_eq!(popup.data(), Some(&0));
    assert_eq!(options_page.data(), Some(&0));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_refetch_bypasses_fresh_entry() {
    let cache = QueryCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let mut query = CachedQuery::new(cache, "count", move || {
      let counter = counter_clone.clone();
      async move { Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst)) }
    });

    query.fetch();
    query.settle().await;
    assert_eq!(query.data(), Some(&0));

    query.refetch();
    query.settle().await;
    assert_eq!(query.data(), Some(&1));
  }

  #[tokio::test]
  async fn test_poll_follows_newer_cache_data() {
    let cache = QueryCache::default();
    let mut query = CachedQuery::new(cache.clone(), "me", || async { Ok::<_, String>(1u32) });
    query.fetch();
    query.settle().await;
    assert!(!query.poll());

    tokio::time::sleep(Duration::from_millis(5)).await;
    cache
      .set_query_data("me", &2u32, QueryOptions::default())
      .unwrap();

    assert!(query.poll());
    assert_eq!(query.data(), Some(&2));
  }
}
