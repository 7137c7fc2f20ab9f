//! Refetch triggers driven by realtime model updates.
//!
//! The server writes a timestamp to `updates/models/{model}/{prop}/{id}`
//! whenever that property of that record changes. An [`UpdateListener`]
//! subscribes to the paths of the records a query depends on and calls the
//! query's refetch callback, debounced, whenever one of them reports a
//! timestamp at least as new as the data the query holds.

mod debounce;
mod names;

use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::error::Result;
use crate::realtime::{Subscription, ValueListener};

pub use debounce::{Debouncer, DEFAULT_DEBOUNCE};
pub use names::{
  notification_path, Identifier, ModelPropRef, NameDirectory, Resolution, MODEL_NAMES_PATH,
  PROPERTY_NAMES_PATH,
};

/// Callback run when watched data changed on the server.
pub type RefetchFn = Arc<dyn Fn() + Send + Sync>;

/// Values the subscriptions read at delivery time. Updated on every
/// [`UpdateListener::update`] without touching the subscriptions.
struct Latest {
  refetch: Mutex<RefetchFn>,
  updated_at: Arc<AtomicI64>,
}

impl Latest {
  fn set_refetch(&self, refetch: RefetchFn) {
    *self.refetch.lock().unwrap_or_else(|e| e.into_inner()) = refetch;
  }

  fn refetch(&self) -> RefetchFn {
    Arc::clone(&self.refetch.lock().unwrap_or_else(|e| e.into_inner()))
  }

  /// Only numbers count, and only when they are not older than the data
  /// already held.
  fn is_fresh(&self, value: &Value) -> bool {
    value
      .as_f64()
      .is_some_and(|updated_at| updated_at >= self.updated_at.load(Ordering::SeqCst) as f64)
  }
}

/// Open subscriptions for one set of paths.
struct ActiveSet {
  paths: Vec<String>,
  debouncer: Arc<Debouncer>,
  subscriptions: Vec<Subscription>,
}

/// Keeps one subscription per watched (model, property, record) and calls
/// the latest refetch callback when any of them reports an update.
pub struct UpdateListener {
  ctx: ServerContext,
  latest: Arc<Latest>,
  active: Option<ActiveSet>,
}

impl UpdateListener {
  pub fn new(ctx: &ServerContext) -> Self {
    Self::sharing_timestamp(ctx, Arc::new(AtomicI64::new(0)))
  }

  /// Compare notifications against a timestamp cell owned by someone else,
  /// typically the query whose data is being watched.
  pub fn sharing_timestamp(ctx: &ServerContext, updated_at: Arc<AtomicI64>) -> Self {
    let noop: RefetchFn = Arc::new(|| {});
    Self {
      ctx: ctx.clone(),
      latest: Arc::new(Latest {
        refetch: Mutex::new(noop),
        updated_at,
      }),
      active: None,
    }
  }

  /// Paths currently subscribed to, in reference order.
  pub fn paths(&self) -> &[String] {
    self
      .active
      .as_ref()
      .map_or(&[][..], |active| active.paths.as_slice())
  }

  pub fn is_listening(&self) -> bool {
    self.active.is_some()
  }

  /// Bring the subscriptions in line with `refs`.
  ///
  /// The callback and timestamp are always replaced. Subscriptions are only
  /// reopened when the resolved path list differs from the current one.
  /// If the name tables cannot be loaded the listener drops every
  /// subscription and returns the error.
  pub async fn update(
    &mut self,
    refs: &[ModelPropRef],
    updated_at: i64,
    refetch: RefetchFn,
  ) -> Result<()> {
    self.latest.set_refetch(refetch);
    self.latest.updated_at.store(updated_at, Ordering::SeqCst);

    if refs.is_empty() {
      self.teardown();
      return Ok(());
    }

    let directory = match NameDirectory::load(&self.ctx).await {
      Ok(directory) => directory,
      Err(e) => {
        self.teardown();
        return Err(e);
      }
    };

    let paths: Vec<String> = refs
      .iter()
      .filter_map(|reference| match directory.resolve(reference) {
        Resolution::Path(path) => Some(path),
        Resolution::Unresolved {
          unknown_model,
          unknown_prop,
        } => {
          warn!(
            ?reference,
            ?unknown_model,
            ?unknown_prop,
            "Cannot listen to unknown model property"
          );
          None
        }
      })
      .collect();

    if self.paths() == paths.as_slice() {
      return Ok(());
    }

    self.teardown();
    if paths.is_empty() {
      return Ok(());
    }

    self.active = Some(self.subscribe_all(paths)?);
    Ok(())
  }

  fn subscribe_all(&self, paths: Vec<String>) -> Result<ActiveSet> {
    let latest = Arc::clone(&self.latest);
    let debouncer = Arc::new(Debouncer::new(
      self.ctx.debounce(),
      Arc::new(move || {
        info!("Watched model changed, refetching");
        (latest.refetch())();
      }),
    )?);

    let listener: ValueListener = {
      let latest = Arc::clone(&self.latest);
      let debouncer = Arc::clone(&debouncer);
      Arc::new(move |value: Value| {
        if latest.is_fresh(&value) {
          debouncer.schedule();
        }
      })
    };

    let channel = self.ctx.channel();
    let subscriptions = paths
      .iter()
      .map(|path| channel.subscribe(path, Arc::clone(&listener)))
      .collect();

    debug!(?paths, "Listening for model updates");
    Ok(ActiveSet {
      paths,
      debouncer,
      subscriptions,
    })
  }

  /// Close every subscription and cancel the pending refetch. No refetch
  /// fires after this returns.
  pub fn teardown(&mut self) {
    if let Some(active) = self.active.take() {
      active.debouncer.close();
      drop(active.subscriptions);
      debug!(paths = ?active.paths, "Stopped listening for model updates");
    }
  }
}

impl Drop for UpdateListener {
  fn drop(&mut self) {
    self.teardown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::realtime::MemoryChannel;
  use crate::server::{ServerClient, StaticToken};
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  const NOW: i64 = 1_700_000_000_000;
  const PATH: &str = "updates/models/1/7/42";

  /// Context whose name tables are already cached, so no server is needed.
  async fn context(channel: &MemoryChannel) -> ServerContext {
    let client = ServerClient::new("http://127.0.0.1:9", Arc::new(StaticToken(None)));
    let ctx = ServerContext::builder(client)
      .channel(Arc::new(channel.clone()))
      .build();
    ctx
      .cache()
      .set(
        &ctx.query_key(MODEL_NAMES_PATH, None),
        json!([{ "id": 1, "name": "User" }, { "id": 2, "name": "Invoice" }]),
      )
      .await;
    ctx
      .cache()
      .set(
        &ctx.query_key(PROPERTY_NAMES_PATH, None),
        json!([{ "id": 7, "name": "email" }, { "id": 8, "name": "total" }]),
      )
      .await;
    ctx
  }

  fn counter() -> (RefetchFn, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&count);
    (
      Arc::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
      }),
      count,
    )
  }

  async fn listening(channel: &MemoryChannel) -> (UpdateListener, Arc<AtomicU32>) {
    let ctx = context(channel).await;
    let mut listener = UpdateListener::new(&ctx);
    let (refetch, count) = counter();
    listener
      .update(&[ModelPropRef::new("User", "email", 42)], NOW, refetch)
      .await
      .unwrap();
    (listener, count)
  }

  #[tokio::test(start_paused = true)]
  async fn test_burst_of_updates_refetches_once() {
    let channel = MemoryChannel::new();
    let (_listener, count) = listening(&channel).await;

    for offset in 0..10 {
      channel.publish(PATH, json!(NOW + offset));
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_older_updates_are_ignored() {
    let channel = MemoryChannel::new();
    let (_listener, count) = listening(&channel).await;

    channel.publish(PATH, json!(NOW - 1));
    channel.publish(PATH, json!(0));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // Equal timestamps count as updates
    channel.publish(PATH, json!(NOW));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_non_numeric_updates_are_ignored() {
    let channel = MemoryChannel::new();
    let (_listener, count) = listening(&channel).await;

    for value in [
      json!(null),
      json!("1800000000000"),
      json!({ "at": NOW + 1 }),
      json!([NOW + 1]),
      json!(true),
    ] {
      channel.publish(PATH, value);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_teardown_cancels_pending_refetch() {
    let channel = MemoryChannel::new();
    let (mut listener, count) = listening(&channel).await;

    channel.publish(PATH, json!(NOW + 1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.teardown();

    assert!(channel.subscribed_paths().is_empty());
    channel.publish(PATH, json!(NOW + 2));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_cancels_pending_refetch() {
    let channel = MemoryChannel::new();
    let (listener, count) = listening(&channel).await;

    channel.publish(PATH, json!(NOW + 1));
    drop(listener);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(channel.subscribed_paths().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_latest_callback_and_timestamp_are_used() {
    let channel = MemoryChannel::new();
    let ctx = context(&channel).await;
    let mut listener = UpdateListener::new(&ctx);
    let refs = [ModelPropRef::new("User", "email", 42)];

    let (first, first_count) = counter();
    listener.update(&refs, NOW, first).await.unwrap();

    let (second, second_count) = counter();
    listener.update(&refs, NOW + 1000, second).await.unwrap();
    assert_eq!(channel.listener_count(PATH), 1);

    channel.publish(PATH, json!(NOW + 500));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(second_count.load(Ordering::SeqCst), 0);

    channel.publish(PATH, json!(NOW + 1500));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first_count.load(Ordering::SeqCst), 0);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_path_change_resubscribes() {
    let channel = MemoryChannel::new();
    let (mut listener, _) = listening(&channel).await;
    let (refetch, _) = counter();

    listener
      .update(
        &[
          ModelPropRef::new("Invoice", "total", "inv-1"),
          ModelPropRef::new("User", "email", 42),
        ],
        NOW,
        refetch.clone(),
      )
      .await
      .unwrap();
    assert_eq!(
      channel.subscribed_paths(),
      vec![
        "updates/models/1/7/42".to_string(),
        "updates/models/2/8/inv-1".to_string()
      ]
    );

    listener.update(&[], NOW, refetch).await.unwrap();
    assert!(!listener.is_listening());
    assert!(channel.subscribed_paths().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_unknown_names_get_no_subscription() {
    let channel = MemoryChannel::new();
    let ctx = context(&channel).await;
    let mut listener = UpdateListener::new(&ctx);
    let (refetch, _) = counter();

    listener
      .update(
        &[
          ModelPropRef::new("Ghost", "email", 1),
          ModelPropRef::new("User", "email", 42),
        ],
        NOW,
        refetch,
      )
      .await
      .unwrap();
    assert_eq!(listener.paths(), &[PATH.to_string()]);
  }
}
