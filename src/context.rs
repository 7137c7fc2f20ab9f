//! Shared dependencies of every query and listener.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheResult, CachedEntry, QueryCache, QueryKey};
use crate::config::Config;
use crate::error::Result;
use crate::listener::DEFAULT_DEBOUNCE;
use crate::realtime::{FirebaseChannel, MemoryChannel, NotificationChannel};
use crate::retry::RetryPolicy;
use crate::server::{SearchParams, ServerClient, TokenProvider};

/// Everything a query needs: the server client, the shared cache, the
/// realtime channel and the identity the cache is keyed by.
///
/// Clones share the cache and the channel.
#[derive(Clone)]
pub struct ServerContext {
  client: ServerClient,
  cache: QueryCache,
  channel: Arc<dyn NotificationChannel>,
  base_query_key: Vec<String>,
  user_uid: Option<String>,
  debounce: Duration,
  retry: RetryPolicy,
}

impl ServerContext {
  pub fn builder(client: ServerClient) -> ServerContextBuilder {
    ServerContextBuilder::new(client)
  }

  /// Build a context from configuration. Updates stream from the configured
  /// realtime database; without one, nothing is ever notified.
  pub fn from_config(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
    let client = ServerClient::new(&config.server.host, Arc::clone(&tokens))
      .with_extra_headers(&config.server.extra_headers)?;

    let cache = match config.query.cache_capacity {
      Some(max_entries) => QueryCache::with_capacity(max_entries),
      None => QueryCache::default(),
    };

    let mut builder = Self::builder(client)
      .cache(cache)
      .base_query_key(config.query.base_key.clone())
      .user_uid(config.user_uid.clone())
      .debounce(config.query.debounce())
      .retry(RetryPolicy::default().with_max_retries(config.query.retry_bound));

    if let Some(database_url) = &config.realtime.database_url {
      builder = builder.channel(Arc::new(FirebaseChannel::new(database_url, tokens)));
    }

    Ok(builder.build())
  }

  /// The same context for another signed-in user. The cache is shared;
  /// the user is part of every key, so entries never mix.
  pub fn with_user_uid(&self, user_uid: Option<String>) -> Self {
    Self {
      user_uid,
      ..self.clone()
    }
  }

  pub fn client(&self) -> &ServerClient {
    &self.client
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn channel(&self) -> Arc<dyn NotificationChannel> {
    Arc::clone(&self.channel)
  }

  pub fn base_query_key(&self) -> &[String] {
    &self.base_query_key
  }

  pub fn user_uid(&self) -> Option<&str> {
    self.user_uid.as_deref()
  }

  pub fn debounce(&self) -> Duration {
    self.debounce
  }

  /// Retry policy used when a query doesn't set its own.
  pub fn retry(&self) -> RetryPolicy {
    self.retry
  }

  pub fn query_key(&self, path: &str, search_params: Option<SearchParams>) -> QueryKey {
    QueryKey::get(
      &self.base_query_key,
      path,
      search_params,
      self.user_uid.clone(),
    )
  }

  /// Fetch the key's path, retrying under `retry`.
  pub async fn fetch_network(&self, key: &QueryKey, retry: RetryPolicy) -> Result<Value> {
    retry
      .run(|| self.client.get_value(&key.path, key.search_params.as_ref()))
      .await
  }

  /// Cache-first read of `key`.
  pub async fn fetch_cached(
    &self,
    key: &QueryKey,
    stale_time: Option<Duration>,
    retry: RetryPolicy,
  ) -> Result<CacheResult> {
    self
      .cache
      .fetch(key, stale_time, || self.fetch_network(key, retry))
      .await
  }

  /// Network read of `key`, written to the cache on success.
  pub async fn refresh(&self, key: &QueryKey, retry: RetryPolicy) -> Result<CachedEntry> {
    self
      .cache
      .refresh(key, || self.fetch_network(key, retry))
      .await
  }
}

pub struct ServerContextBuilder {
  client: ServerClient,
  cache: Option<QueryCache>,
  channel: Option<Arc<dyn NotificationChannel>>,
  base_query_key: Vec<String>,
  user_uid: Option<String>,
  debounce: Duration,
  retry: RetryPolicy,
}

impl ServerContextBuilder {
  fn new(client: ServerClient) -> Self {
    Self {
      client,
      cache: None,
      channel: None,
      base_query_key: Vec::new(),
      user_uid: None,
      debounce: DEFAULT_DEBOUNCE,
      retry: RetryPolicy::default(),
    }
  }

  /// Share an existing cache, e.g. between contexts of different hosts.
  pub fn cache(mut self, cache: QueryCache) -> Self {
    self.cache = Some(cache);
    self
  }

  pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
    self.channel = Some(channel);
    self
  }

  pub fn base_query_key(mut self, base_query_key: Vec<String>) -> Self {
    self.base_query_key = base_query_key;
    self
  }

  pub fn user_uid(mut self, user_uid: Option<String>) -> Self {
    self.user_uid = user_uid;
    self
  }

  pub fn debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn build(self) -> ServerContext {
    ServerContext {
      client: self.client,
      cache: self.cache.unwrap_or_default(),
      channel: self
        .channel
        .unwrap_or_else(|| Arc::new(MemoryChannel::new())),
      base_query_key: self.base_query_key,
      user_uid: self.user_uid,
      debounce: self.debounce,
      retry: self.retry,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::server::StaticToken;
  use serde_json::json;

  fn context() -> ServerContext {
    let client = ServerClient::new("http://127.0.0.1:9", Arc::new(StaticToken(None)));
    ServerContext::builder(client)
      .base_query_key(vec!["apphive".into()])
      .user_uid(Some("alice".into()))
      .build()
  }

  #[test]
  fn test_query_key_uses_context_identity() {
    let ctx = context();
    let key = ctx.query_key("/apps", None);
    assert_eq!(key.base, vec!["apphive".to_string()]);
    assert_eq!(key.user_uid.as_deref(), Some("alice"));
    assert_eq!(key.tag, "get");
  }

  #[tokio::test]
  async fn test_other_user_shares_cache_but_not_entries() {
    let alice = context();
    let bob = alice.with_user_uid(Some("bob".into()));

    alice
      .cache()
      .set(&alice.query_key("/apps", None), json!(["a"]))
      .await;
    assert!(bob.cache().contains(&alice.query_key("/apps", None)));
    assert!(!bob.cache().contains(&bob.query_key("/apps", None)));
  }
}
