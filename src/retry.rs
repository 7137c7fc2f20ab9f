//! Retry policy for query fetches.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

pub const DEFAULT_RETRY_BOUND: u32 = 3;

/// Decides whether a failed fetch is attempted again, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries allowed after the first failure. A bound of `n` means at most
  /// `n + 1` calls.
  pub max_retries: u32,
  /// Delay before the first retry; doubled for each following one.
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: DEFAULT_RETRY_BOUND,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
    self.base_delay = base_delay;
    self
  }

  /// A policy that never retries.
  pub fn never() -> Self {
    Self::default().with_max_retries(0)
  }

  /// `failure_count` is the number of failures before the one in `error`.
  pub fn should_retry(&self, failure_count: u32, error: &Error) -> bool {
    error.is_retryable() && failure_count < self.max_retries
  }

  pub fn delay_for(&self, failure_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(failure_count);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Run `op` until it succeeds or the policy gives up, returning the last
  /// error in that case.
  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut failure_count = 0;

    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(error) => {
          if !self.should_retry(failure_count, &error) {
            return Err(error);
          }

          let delay = self.delay_for(failure_count);
          warn!(
            attempt = failure_count + 1,
            ?delay,
            error = %error,
            "Request failed, retrying"
          );
          tokio::time::sleep(delay).await;
          failure_count += 1;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::server::ServerError;
  use std::sync::atomic::{AtomicU32, Ordering};

  async fn count_calls(policy: RetryPolicy, error: ServerError) -> u32 {
    let calls = AtomicU32::new(0);
    let result: Result<()> = policy
      .run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        let error = error.clone();
        async move { Err(Error::Server(error)) }
      })
      .await;
    assert!(result.is_err());
    calls.load(Ordering::SeqCst)
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_showable_is_never_retried() {
    let error = ServerError::client_showable("Invalid email", "Correo inválido");
    assert_eq!(count_calls(RetryPolicy::default(), error).await, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_bound_of_three() {
    let policy = RetryPolicy::default().with_max_retries(3);
    assert_eq!(count_calls(policy, ServerError::Generic).await, 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_bound_of_four() {
    let policy = RetryPolicy::default().with_max_retries(4);
    assert_eq!(count_calls(policy, ServerError::Generic).await, 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_auth_session_expired_uses_default_policy() {
    let calls = count_calls(RetryPolicy::default(), ServerError::AuthSessionExpired).await;
    assert_eq!(calls, DEFAULT_RETRY_BOUND + 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_after_failures() {
    let calls = AtomicU32::new(0);
    let result = RetryPolicy::default()
      .run(|| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n < 2 {
            Err(Error::Server(ServerError::Generic))
          } else {
            Ok(n)
          }
        }
      })
      .await
      .unwrap();
    assert_eq!(result, 2);
  }

  #[test]
  fn test_backoff_is_capped() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    assert_eq!(policy.delay_for(40), Duration::from_secs(30));
  }
}
