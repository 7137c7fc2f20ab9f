//! Cache layer that orchestrates caching logic with network fetching.

use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::key::QueryKey;
use super::traits::{now_millis, CacheResult, CachedEntry};

/// Entries keyed by [`QueryKey::cache_hash`].
///
/// Clones share the same entries, so every query built from one context sees
/// them. Fetches are serialized per key: callers that miss the same key at
/// the same time share one network request.
#[derive(Clone)]
pub struct QueryCache {
  entries: Cache<String, CachedEntry>,
}

impl Default for QueryCache {
  fn default() -> Self {
    Self {
      entries: Cache::builder().build(),
    }
  }
}

impl QueryCache {
  /// A cache holding at most `max_entries`; the least recently used go first.
  pub fn with_capacity(max_entries: u64) -> Self {
    Self {
      entries: Cache::new(max_entries),
    }
  }

  /// `None` means the entry never goes stale.
  fn is_stale(entry: &CachedEntry, stale_time: Option<Duration>) -> bool {
    match stale_time {
      Some(stale_time) => {
        let age = now_millis().saturating_sub(entry.updated_at);
        age < 0 || age as u128 >= stale_time.as_millis()
      }
      None => false,
    }
  }

  pub async fn get(&self, key: &QueryKey) -> Option<CachedEntry> {
    self.entries.get(&key.cache_hash()).await
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.entries.contains_key(&key.cache_hash())
  }

  /// Write a value as freshly fetched.
  pub async fn set(&self, key: &QueryKey, value: Value) -> CachedEntry {
    let entry = CachedEntry::new(value);
    self.entries.insert(key.cache_hash(), entry.clone()).await;
    entry
  }

  /// Evict the entry for exactly this key.
  pub async fn remove(&self, key: &QueryKey) -> bool {
    let removed = self.entries.remove(&key.cache_hash()).await.is_some();
    debug!(key = %key.description(), removed, "Cache entry removed");
    removed
  }

  pub fn clear(&self) {
    self.entries.invalidate_all();
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. On network failure, return stale cache (offline mode)
  /// 4. Update cache with new data
  pub async fn fetch<F, Fut>(
    &self,
    key: &QueryKey,
    stale_time: Option<Duration>,
    fetcher: F,
  ) -> Result<CacheResult>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    let mut served_stale = false;
    let stale_flag = &mut served_stale;

    let outcome = self
      .entries
      .entry(key.cache_hash())
      .and_try_compute_with(move |cached| async move {
        match cached.map(|entry| entry.into_value()) {
          Some(cached) if !Self::is_stale(&cached, stale_time) => Ok(Op::Nop),
          Some(_) => match fetcher().await {
            Ok(value) => Ok(Op::Put(CachedEntry::new(value))),
            Err(e) => {
              warn!(key = %key.description(), error = %e, "Refresh failed, serving stale entry");
              *stale_flag = true;
              Ok(Op::Nop)
            }
          },
          None => {
            debug!(key = %key.description(), "Cache miss");
            fetcher()
              .await
              .map(|value| Op::Put(CachedEntry::new(value)))
          }
        }
      })
      .await?;

    match outcome {
      CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => {
        Ok(CacheResult::from_network(entry.into_value()))
      }
      CompResult::Unchanged(entry) if served_stale => Ok(CacheResult::offline(entry.into_value())),
      CompResult::Unchanged(entry) => {
        debug!(key = %key.description(), "Cache hit");
        Ok(CacheResult::from_cache(entry.into_value()))
      }
      CompResult::StillNone(_) | CompResult::Removed(_) => {
        Err(Error::CacheEntryMissing(key.description()))
      }
    }
  }

  /// Always fetch; the existing entry is kept if the fetch fails.
  pub async fn refresh<F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<CachedEntry>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    let outcome = self
      .entries
      .entry(key.cache_hash())
      .and_try_compute_with(move |_| async move {
        fetcher()
          .await
          .map(|value| Op::Put(CachedEntry::new(value)))
      })
      .await?;

    match outcome {
      CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => Ok(entry.into_value()),
      _ => Err(Error::CacheEntryMissing(key.description())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::server::ServerError;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn key(path: &str) -> QueryKey {
    QueryKey::get(&["test".to_string()], path, None, None)
  }

  #[tokio::test]
  async fn test_fresh_entry_skips_network() {
    let cache = QueryCache::default();
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
      let result = cache
        .fetch(&key("/a"), None, || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(json!("value"))
        })
        .await
        .unwrap();
      assert_eq!(result.entry.value, json!("value"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_concurrent_misses_share_one_fetch() {
    let cache = QueryCache::default();
    let calls = AtomicU32::new(0);
    let fetcher = || async {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(json!([1, 2]))
    };

    let (key_a, key_b) = (key("/a"), key("/a"));
    let (first, second) = tokio::join!(
      cache.fetch(&key_a, None, fetcher),
      cache.fetch(&key_b, None, fetcher)
    );

    assert_eq!(first.unwrap().entry.value, json!([1, 2]));
    assert_eq!(second.unwrap().source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_entry_is_refetched() {
    let cache = QueryCache::default();
    cache.set(&key("/a"), json!(1)).await;

    let result = cache
      .fetch(&key("/a"), Some(Duration::ZERO), || async { Ok(json!(2)) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(cache.get(&key("/a")).await.map(|e| e.value), Some(json!(2)));
  }

  #[tokio::test]
  async fn test_stale_entry_served_when_refresh_fails() {
    let cache = QueryCache::default();
    cache.set(&key("/a"), json!(1)).await;

    let result = cache
      .fetch(&key("/a"), Some(Duration::ZERO), || async {
        Err(Error::Server(ServerError::Generic))
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.entry.value, json!(1));
  }

  #[tokio::test]
  async fn test_miss_propagates_errors() {
    let cache = QueryCache::default();
    let result = cache
      .fetch(&key("/a"), None, || async {
        Err(Error::Server(ServerError::AuthSessionExpired))
      })
      .await;
    assert!(result.is_err());
    assert!(!cache.contains(&key("/a")));
  }

  #[tokio::test]
  async fn test_refresh_keeps_entry_on_failure() {
    let cache = QueryCache::default();
    cache.set(&key("/a"), json!(1)).await;

    let result = cache
      .refresh(&key("/a"), || async { Err(Error::Server(ServerError::Generic)) })
      .await;
    assert!(result.is_err());
    assert_eq!(cache.get(&key("/a")).await.map(|e| e.value), Some(json!(1)));
  }

  #[tokio::test]
  async fn test_refresh_replaces_entry() {
    let cache = QueryCache::default();
    cache.set(&key("/a"), json!(1)).await;

    let entry = cache
      .refresh(&key("/a"), || async { Ok(json!(2)) })
      .await
      .unwrap();
    assert_eq!(entry.value, json!(2));
    assert_eq!(cache.get(&key("/a")).await, Some(entry));
  }

  #[tokio::test]
  async fn test_remove_is_exact() {
    let cache = QueryCache::default();
    cache.set(&key("/a"), json!(1)).await;
    cache.set(&key("/b"), json!(2)).await;

    assert!(cache.remove(&key("/a")).await);
    assert!(!cache.contains(&key("/a")));
    assert!(cache.contains(&key("/b")));
  }
}
