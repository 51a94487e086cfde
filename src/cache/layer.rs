//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::tiered::TieredCache;
use super::traits::{CacheResult, Cacheable};
use crate::error::{Error, Result};
use crate::fetch::FetchCoordinator;

/// Read-through front for a [`TieredCache`].
///
/// Misses go to the network through a [`FetchCoordinator`], so concurrent
/// readers of one key cause a single remote read, and the cache is populated
/// once per fetch rather than once per waiter.
pub struct CachedFetcher<T> {
  cache: Arc<TieredCache<T>>,
  coordinator: Arc<FetchCoordinator<T>>,
}

impl<T: Cacheable> CachedFetcher<T> {
  pub fn new(cache: Arc<TieredCache<T>>) -> Self {
    Self {
      cache,
      coordinator: Arc::new(FetchCoordinator::new()),
    }
  }

  pub fn cache(&self) -> &Arc<TieredCache<T>> {
    &self.cache
  }

  pub fn coordinator(&self) -> &Arc<FetchCoordinator<T>> {
    &self.coordinator
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check memory, then disk - return on hit
  /// 2. On miss, join or start the single in-flight fetch for `key`
  /// 3. The flight checks the cache again, since a flight that settled after
  ///    step 1 may already have stored the value
  /// 4. Otherwise run `loader` and store its value in both tiers
  ///
  /// A not-found answer from the loader invalidates whatever was cached.
  pub async fn get<F, Fut>(&self, key: &str, loader: F) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if let Some(entry) = self.cache.lookup(key).await {
      return Ok(CacheResult::from_tier(entry.value, entry.tier));
    }

    self.fetch_and_store(key, true, loader).await
  }

  /// Bypass the cache and fetch fresh data.
  ///
  /// If the network fails with a retryable error and a cached copy exists,
  /// the cached copy is served instead (offline mode).
  pub async fn refresh<F, Fut>(&self, key: &str, loader: F) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    match self.fetch_and_store(key, false, loader).await {
      Ok(result) => Ok(result),
      Err(e) if e.is_retryable() => match self.cache.get(key).await {
        Some(stale) => {
          debug!(key, error = %e, "network failed, serving cached copy");
          Ok(CacheResult::offline(stale))
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  async fn fetch_and_store<F, Fut>(&self, key: &str, check_cache: bool, loader: F) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let cache = self.cache.clone();
    let id = key.to_string();
    let served_from = Arc::new(OnceLock::new());
    let served = served_from.clone();
    let result = self
      .coordinator
      .fetch(key, move || {
        let fetch = loader();
        async move {
          if check_cache {
            if let Some(entry) = cache.lookup(&id).await {
              debug!(key = %id, "value stored by an earlier flight");
              let _ = served.set(entry.tier);
              return Ok(entry.value);
            }
          }
          let data = fetch.await?;
          cache.put(data.clone()).await;
          Ok(data)
        }
      })
      .await;

    match result {
      Ok(data) => Ok(match served_from.get() {
        Some(tier) => CacheResult::from_tier(data, *tier),
        None => CacheResult::from_network(data),
      }),
      Err(e) => {
        if let Error::NotFound(_) = &e {
          self.cache.invalidate(key).await;
        }
        Err(e)
      }
    }
  }
}

impl<T> Clone for CachedFetcher<T> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      coordinator: Arc::clone(&self.coordinator),
    }
  }
}
