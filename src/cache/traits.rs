//! Cache entries and where a read was served from.

use chrono::Utc;
use serde_json::Value;

/// A normalized response body and when it was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
  /// The normalized `result` of the response
  pub value: Value,
  /// When the value was fetched, in milliseconds since the Unix epoch
  pub updated_at: i64,
}

impl CachedEntry {
  pub fn new(value: Value) -> Self {
    Self {
      value,
      updated_at: now_millis(),
    }
  }
}

/// An entry handed out by [`QueryCache::fetch`](super::QueryCache::fetch).
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub entry: CachedEntry,
  pub source: CacheSource,
}

impl CacheResult {
  pub fn from_network(entry: CachedEntry) -> Self {
    Self {
      entry,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      entry,
      source: CacheSource::CacheFresh,
    }
  }

  /// A stale entry served because its refresh failed.
  pub fn offline(entry: CachedEntry) -> Self {
    Self {
      entry,
      source: CacheSource::Offline,
    }
  }
}

/// How a read was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the server just now
  Network,
  /// Cached and within the staleness window
  CacheFresh,
  /// Network unavailable, serving a stale cached value
  Offline,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}
