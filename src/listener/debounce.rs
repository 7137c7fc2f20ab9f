//! Single-timer debouncing on the tokio runtime.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct DebounceState {
  /// Bumped by every schedule; a timer only fires if it is still current.
  generation: u64,
  pending: Option<JoinHandle<()>>,
  closed: bool,
}

/// Collapses bursts of [`schedule`](Debouncer::schedule) calls into one call
/// of `fire`, `delay` after the last of them.
///
/// At most one timer is live. `fire` runs while the internal lock is held,
/// so once [`close`](Debouncer::close) returns it can never run again; it
/// must not call back into the debouncer.
pub struct Debouncer {
  delay: Duration,
  runtime: Handle,
  fire: Arc<dyn Fn() + Send + Sync>,
  state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
  /// Must be called from within a tokio runtime; timers run on it.
  pub fn new(delay: Duration, fire: Arc<dyn Fn() + Send + Sync>) -> Result<Self> {
    let runtime = Handle::try_current()
      .map_err(|e| Error::Realtime(format!("debouncer needs a tokio runtime: {}", e)))?;

    Ok(Self {
      delay,
      runtime,
      fire,
      state: Arc::new(Mutex::new(DebounceState::default())),
    })
  }

  fn lock(state: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Cancel the pending timer, if any, and start a new one.
  pub fn schedule(&self) {
    let mut state = Self::lock(&self.state);
    if state.closed {
      return;
    }

    if let Some(pending) = state.pending.take() {
      pending.abort();
    }
    state.generation += 1;
    let generation = state.generation;

    let delay = self.delay;
    let fire = Arc::clone(&self.fire);
    let shared = Arc::clone(&self.state);
    state.pending = Some(self.runtime.spawn(async move {
      tokio::time::sleep(delay).await;

      let mut state = Self::lock(&shared);
      if state.closed || state.generation != generation {
        return;
      }
      state.pending = None;
      fire();
    }));
  }

  pub fn is_pending(&self) -> bool {
    Self::lock(&self.state).pending.is_some()
  }

  /// Cancel the pending timer and refuse any later schedule.
  pub fn close(&self) {
    let mut state = Self::lock(&self.state);
    state.closed = true;
    state.generation += 1;
    if let Some(pending) = state.pending.take() {
      pending.abort();
    }
  }
}

impl Drop for Debouncer {
  fn drop(&mut self) {
    self.close();
  }
}
