//! Cached, suspending queries against the Apphive server.
//!
//! Inspired by TanStack Query's `useSuspenseQuery`, a [`SuspenseQuery<T>`]
//! reads a GET endpoint through the context's shared cache, retries failed
//! fetches, and can refetch itself when the server reports that the records
//! it was built from changed.
//!
//! # Example
//!
//! ```ignore
//! let options = QueryOptions::default()
//!   .listen_to(|user: &User| vec![ModelPropRef::new("User", "email", user.id)]);
//! let mut query = SuspenseQuery::new(&ctx, "/users/me", options)?;
//!
//! // Suspends until data (or an error) is available
//! let user = query.read().await?;
//!
//! // Re-read whenever a listener-triggered refetch lands
//! let mut changes = query.subscribe();
//! while changes.changed().await.is_ok() {
//!   let user = query.read().await?;
//!   render(&user);
//! }
//! ```

use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{CacheSource, CachedEntry, QueryKey};
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::listener::{ModelPropRef, RefetchFn, UpdateListener};
use crate::retry::RetryPolicy;
use crate::server::SearchParams;

/// Errors are shared between the caller and every state observer.
pub type QueryResult<T> = std::result::Result<T, Arc<Error>>;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// No data yet (or evicted by a clean refetch) and a fetch is running
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with no data to fall back on
  Error(Arc<Error>),
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

  pub fn error(&self) -> Option<&Error> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type PropsToListen<T> = Arc<dyn Fn(&T) -> Vec<ModelPropRef> + Send + Sync>;

/// Options for [`SuspenseQuery`].
pub struct QueryOptions<T> {
  /// How long data counts as fresh. `None` (the default) never goes stale.
  pub stale_time: Option<Duration>,
  pub search_params: Option<SearchParams>,
  /// When true, a refetch first removes the exact cache entry, so readers
  /// wait for fresh data and errors surface instead of the old value.
  /// When false, the cached value is kept while refetching.
  pub clean_on_refetch: bool,
  /// Derive the records to watch from the fetched data. Updates to any of
  /// them trigger a refetch.
  pub props_to_listen: Option<PropsToListen<T>>,
  /// Called at the start of every refetch.
  pub on_refetch: Option<RefetchFn>,
  /// Defaults to the context's policy.
  pub retry: Option<RetryPolicy>,
}

impl<T> Default for QueryOptions<T> {
  fn default() -> Self {
    Self {
      stale_time: None,
      search_params: None,
      clean_on_refetch: false,
      props_to_listen: None,
      on_refetch: None,
      retry: None,
    }
  }
}

impl<T> QueryOptions<T> {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn with_search_params(mut self, search_params: SearchParams) -> Self {
    self.search_params = Some(search_params);
    self
  }

  pub fn clean_on_refetch(mut self, clean: bool) -> Self {
    self.clean_on_refetch = clean;
    self
  }

  pub fn listen_to<F>(mut self, props_to_listen: F) -> Self
  where
    F: Fn(&T) -> Vec<ModelPropRef> + Send + Sync + 'static,
  {
    self.props_to_listen = Some(Arc::new(props_to_listen));
    self
  }

  pub fn on_refetch<F>(mut self, on_refetch: F) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.on_refetch = Some(Arc::new(on_refetch));
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }
}

/// The part of a query that refetches triggered by the listener can reach.
struct QueryCore<T> {
  ctx: ServerContext,
  key: QueryKey,
  stale_time: Option<Duration>,
  clean_on_refetch: bool,
  on_refetch: Option<RefetchFn>,
  retry: RetryPolicy,
  state: watch::Sender<QueryState<T>>,
  /// Epoch millis of the data in `state`; shared with the listener
  updated_at: Arc<AtomicI64>,
}

impl<T> QueryCore<T>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  async fn load(&self) -> QueryResult<T> {
    self.state.send_if_modified(|state| {
      if state.data().is_none() && !state.is_loading() {
        *state = QueryState::Loading;
        true
      } else {
        false
      }
    });

    let result = self
      .ctx
      .fetch_cached(&self.key, self.stale_time, self.retry)
      .await;
    let from_cache = matches!(&result, Ok(r) if r.source != CacheSource::Network);
    self.settle(result.map(|r| r.entry), from_cache)
  }

  async fn refetch(&self) -> QueryResult<T> {
    if let Some(on_refetch) = &self.on_refetch {
      on_refetch();
    }

    if self.clean_on_refetch {
      self.ctx.cache().remove(&self.key).await;
      self.state.send_replace(QueryState::Loading);
      let result = self.ctx.refresh(&self.key, self.retry).await;
      return self.settle(result, false);
    }

    match self.ctx.refresh(&self.key, self.retry).await {
      Ok(entry) => self.settle(Ok(entry), false),
      Err(e) => {
        let e = Arc::new(e);
        warn!(
          key = %self.key.description(),
          error = %e,
          "Refetch failed, keeping cached data"
        );
        self.state.send_if_modified(|state| {
          if state.data().is_none() {
            *state = QueryState::Error(Arc::clone(&e));
            true
          } else {
            false
          }
        });
        Err(e)
      }
    }
  }

  /// Publish the outcome of a fetch. Re-reading the entry already shown
  /// does not notify observers, and data older than what is shown never
  /// replaces it.
  fn settle(&self, result: Result<CachedEntry>, from_cache: bool) -> QueryResult<T> {
    let decoded = result.and_then(|entry| {
      let data = serde_json::from_value::<T>(entry.value)?;
      Ok((data, entry.updated_at))
    });

    match decoded {
      Ok((data, updated_at)) => {
        let previous = self.updated_at.fetch_max(updated_at, Ordering::SeqCst);
        if updated_at < previous {
          if let Some(newer) = self.state.borrow().data().cloned() {
            debug!(key = %self.key.description(), "Ignoring result older than current data");
            return Ok(newer);
          }
        }

        self.state.send_if_modified(|state| {
          if from_cache && state.is_success() && previous == updated_at {
            return false;
          }
          *state = QueryState::Success(data.clone());
          true
        });
        Ok(data)
      }
      Err(e) => {
        let e = Arc::new(e);
        self.state.send_replace(QueryState::Error(Arc::clone(&e)));
        Err(e)
      }
    }
  }
}

/// A GET query bound to one path, search params and user.
///
/// Dropping the query stops listening for updates.
pub struct SuspenseQuery<T> {
  core: Arc<QueryCore<T>>,
  props_to_listen: Option<PropsToListen<T>>,
  listener: UpdateListener,
}

impl<T> SuspenseQuery<T>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// `path` must start with `/`.
  pub fn new(
    ctx: &ServerContext,
    path: impl Into<String>,
    options: QueryOptions<T>,
  ) -> Result<Self> {
    let path = path.into();
    if !path.starts_with('/') {
      return Err(Error::InvalidPath(path));
    }

    let key = ctx.query_key(&path, options.search_params);
    let updated_at = Arc::new(AtomicI64::new(0));
    let (state, _) = watch::channel(QueryState::Idle);

    let core = Arc::new(QueryCore {
      ctx: ctx.clone(),
      key,
      stale_time: options.stale_time,
      clean_on_refetch: options.clean_on_refetch,
      on_refetch: options.on_refetch,
      retry: options.retry.unwrap_or_else(|| ctx.retry()),
      state,
      updated_at: Arc::clone(&updated_at),
    });

    Ok(Self {
      core,
      props_to_listen: options.props_to_listen,
      listener: UpdateListener::sharing_timestamp(ctx, updated_at),
    })
  }

  pub fn key(&self) -> &QueryKey {
    &self.core.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> QueryState<T> {
    self.core.state.borrow().clone()
  }

  /// Get the data if the query succeeded.
  pub fn data(&self) -> Option<T> {
    self.core.state.borrow().data().cloned()
  }

  /// Receiver that is notified whenever the state changes, including after
  /// refetches triggered by model updates.
  pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
    self.core.state.subscribe()
  }

  /// When the current data was fetched, in milliseconds since the Unix
  /// epoch; 0 before the first successful fetch.
  pub fn data_updated_at(&self) -> i64 {
    self.core.updated_at.load(Ordering::SeqCst)
  }

  /// Paths this query is currently listening to.
  pub fn listened_paths(&self) -> &[String] {
    self.listener.paths()
  }

  /// Return cached data, or wait for the fetch if there is none (or it is
  /// stale). Also brings the update listener in line with the data.
  pub async fn read(&mut self) -> QueryResult<T> {
    let data = self.core.load().await?;
    self.sync_listener(&data).await;
    Ok(data)
  }

  /// Fetch again, in the mode chosen by `clean_on_refetch`.
  pub async fn refetch(&self) -> QueryResult<T> {
    self.core.refetch().await
  }

  /// Callback handed to the listener. Holds the core weakly so a pending
  /// notification never keeps a dropped query alive.
  fn refetch_callback(&self) -> RefetchFn {
    let core: Weak<QueryCore<T>> = Arc::downgrade(&self.core);
    Arc::new(move || {
      let Some(core) = core.upgrade() else {
        return;
      };
      tokio::spawn(async move {
        // Failures are already published to the state
        let _ = core.refetch().await;
      });
    })
  }

  async fn sync_listener(&mut self, data: &T) {
    let Some(props_to_listen) = &self.props_to_listen else {
      return;
    };

    let refs = props_to_listen(data);
    let refetch = self.refetch_callback();
    let updated_at = self.data_updated_at();

    if let Err(e) = self.listener.update(&refs, updated_at, refetch).await {
      warn!(key = %self.core.key.description(), error = %e, "Not listening for model updates");
    } else {
      debug!(key = %self.core.key.description(), paths = ?self.listener.paths(), "Listener synced");
    }
  }
}
