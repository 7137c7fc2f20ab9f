//! Path-addressed realtime value streams.
//!
//! A [`NotificationChannel`] delivers every new value written under a path to
//! the listeners subscribed to it. Values are arbitrary JSON; consumers are
//! expected to check their shape.

mod firebase;
mod memory;

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use firebase::FirebaseChannel;
pub use memory::MemoryChannel;

/// Callback invoked with each value delivered on a path.
pub type ValueListener = Arc<dyn Fn(Value) + Send + Sync>;

pub trait NotificationChannel: Send + Sync {
  /// Start delivering values written under `path` to `listener` until the
  /// returned guard is dropped.
  fn subscribe(&self, path: &str, listener: ValueListener) -> Subscription;
}

/// Guard for an open subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  path: String,
  unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  pub fn new(path: impl Into<String>, unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      path: path.into(),
      unsubscribe: Some(Box::new(unsubscribe)),
    }
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn unsubscribe(mut self) {
    self.close();
  }

  fn close(&mut self) {
    if let Some(unsubscribe) = self.unsubscribe.take() {
      unsubscribe();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.close();
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("path", &self.path)
      .field("open", &self.unsubscribe.is_some())
      .finish()
  }
}
