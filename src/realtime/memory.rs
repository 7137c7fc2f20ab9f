//! In-process notification hub.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

use super::{NotificationChannel, Subscription, ValueListener};

#[derive(Default)]
struct Hub {
  next_id: u64,
  listeners: HashMap<String, Vec<(u64, ValueListener)>>,
}

/// A [`NotificationChannel`] whose values are published from the same
/// process. Unsubscribing takes effect before `unsubscribe` returns.
#[derive(Clone, Default)]
pub struct MemoryChannel {
  hub: Arc<Mutex<Hub>>,
}

impl MemoryChannel {
  pub fn new() -> Self {
    Self::default()
  }

  fn hub(&self) -> MutexGuard<'_, Hub> {
    self.hub.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Deliver `value` to every listener of `path`. Returns how many listeners
  /// received it.
  pub fn publish(&self, path: &str, value: Value) -> usize {
    // Listeners run outside the lock so they may subscribe or unsubscribe
    let listeners: Vec<ValueListener> = self
      .hub()
      .listeners
      .get(path)
      .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default();

    trace!(path, listeners = listeners.len(), "publish");
    for listener in &listeners {
      listener(value.clone());
    }
    listeners.len()
  }

  /// Paths with at least one listener, sorted.
  pub fn subscribed_paths(&self) -> Vec<String> {
    let mut paths: Vec<String> = self
      .hub()
      .listeners
      .iter()
      .filter(|(_, entries)| !entries.is_empty())
      .map(|(path, _)| path.clone())
      .collect();
    paths.sort();
    paths
  }

  pub fn listener_count(&self, path: &str) -> usize {
    self.hub().listeners.get(path).map_or(0, Vec::len)
  }
}

impl NotificationChannel for MemoryChannel {
  fn subscribe(&self, path: &str, listener: ValueListener) -> Subscription {
    let id = {
      let mut hub = self.hub();
      hub.next_id += 1;
      let id = hub.next_id;
      hub
        .listeners
        .entry(path.to_string())
        .or_default()
        .push((id, listener));
      id
    };

    let hub = Arc::clone(&self.hub);
    let owned_path = path.to_string();
    Subscription::new(path, move || {
      let mut hub = hub.lock().unwrap_or_else(|e| e.into_inner());
      if let Some(entries) = hub.listeners.get_mut(&owned_path) {
        entries.retain(|(entry_id, _)| *entry_id != id);
        if entries.is_empty() {
          hub.listeners.remove(&owned_path);
        }
      }
    })
  }
}
