//! Exponential backoff around fetch attempts.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::status::{Phase, StatusTracker};
use crate::config::{SourceDescriptor, SyncConfig};
use crate::error::FetchError;

/// Retry limits for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base: Duration,
  pub ceiling: Duration,
}

impl RetryPolicy {
  pub fn for_source(descriptor: &SourceDescriptor, config: &SyncConfig) -> Self {
    Self {
      max_retries: config.max_retries_for(descriptor),
      base: Duration::from_millis(descriptor.backoff_base_ms),
      ceiling: config.backoff_ceiling(),
    }
  }

  /// `base * 2^retry`, capped at the ceiling.
  pub fn delay(&self, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    self.base.saturating_mul(factor).min(self.ceiling)
  }
}

/// Spread a delay by ±20% so sources failing together do not retry in lockstep.
pub fn jitter(delay: Duration) -> Duration {
  let factor = rand::rng().random_range(0.8..=1.2);
  delay.mul_f64(factor)
}

/// The last error of an attempt that ran out of retries or was not retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
  pub error: FetchError,
  pub retries: u32,
}

/// Drives fetch attempts through the `Fetching -> Backoff -> Fetching` loop.
pub struct RetryController {
  status: Arc<StatusTracker>,
  /// Consecutive failed attempts per source
  failures: Mutex<HashMap<String, u32>>,
  /// Wakes a key sleeping in backoff
  wakers: Mutex<HashMap<String, Arc<Notify>>>,
  shutdown: CancellationToken,
}

impl RetryController {
  pub fn new(status: Arc<StatusTracker>, shutdown: CancellationToken) -> Self {
    Self {
      status,
      failures: Mutex::new(HashMap::new()),
      wakers: Mutex::new(HashMap::new()),
      shutdown,
    }
  }

  /// Run `fetch` until it succeeds, fails permanently, or exhausts the policy.
  pub async fn attempt<T, F, Fut>(
    &self,
    descriptor: &SourceDescriptor,
    key: &str,
    policy: RetryPolicy,
    mut fetch: F,
  ) -> Result<T, AttemptError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    let source = descriptor.id.as_str();
    let waker = self.waker(key);
    let mut retries = 0;

    loop {
      // Registered before the attempt so a cancel_backoff issued while
      // fetching still cuts the following wait short
      let mut cut_short = pin!(waker.notified());
      cut_short.as_mut().enable();

      self.status.set_phase(key, Phase::Fetching);
      let error = match fetch().await {
        Ok(value) => {
          self.failures.lock().remove(source);
          return Ok(value);
        }
        Err(error) => error,
      };

      *self.failures.lock().entry(source.to_string()).or_insert(0) += 1;

      if !error.is_retryable() || retries >= policy.max_retries {
        warn!(source, key, retries, error = %error, "Giving up on fetch");
        return Err(AttemptError { error, retries });
      }

      let delay = jitter(policy.delay(retries));
      retries += 1;
      debug!(source, key, retry = retries, ?delay, error = %error, "Backing off");
      self.status.set_phase(key, Phase::Backoff);

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cut_short.as_mut() => {
          debug!(source, key, "Backoff cut short");
        }
        _ = self.shutdown.cancelled() => {
          return Err(AttemptError { error: FetchError::Cancelled, retries });
        }
      }
    }
  }

  /// Skip the remaining backoff of `key`, or the next one if it is still fetching.
  pub fn cancel_backoff(&self, key: &str) {
    if let Some(waker) = self.wakers.lock().get(key) {
      waker.notify_waiters();
    }
  }

  pub fn consecutive_failures(&self, source: &str) -> u32 {
    self.failures.lock().get(source).copied().unwrap_or(0)
  }

  fn waker(&self, key: &str) -> Arc<Notify> {
    Arc::clone(
      self
        .wakers
        .lock()
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Notify::new())),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn descriptor() -> SourceDescriptor {
    SourceDescriptor {
      id: "casualties".to_string(),
      keys: vec![],
      local_snapshot: "{key}.json".to_string(),
      remote_endpoint: None,
      ttl_secs: 60,
      max_retries: 3,
      backoff_base_ms: 1,
    }
  }

  fn policy(max_retries: u32, base_ms: u64) -> RetryPolicy {
    RetryPolicy {
      max_retries,
      base: Duration::from_millis(base_ms),
      ceiling: Duration::from_secs(30),
    }
  }

  fn controller() -> RetryController {
    RetryController::new(
      Arc::new(StatusTracker::new(Vec::new(), 20)),
      CancellationToken::new(),
    )
  }

  #[test]
  fn test_delay_doubles_up_to_ceiling() {
    let policy = policy(3, 1000);
    assert_eq!(policy.delay(0), Duration::from_millis(1000));
    assert_eq!(policy.delay(1), Duration::from_millis(2000));
    assert_eq!(policy.delay(3), Duration::from_millis(8000));
    assert_eq!(policy.delay(6), Duration::from_secs(30));
    assert_eq!(policy.delay(40), Duration::from_secs(30));
  }

  #[test]
  fn test_jitter_bounds() {
    for _ in 0..100 {
      let d = jitter(Duration::from_millis(1000));
      assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
    }
  }

  #[test]
  fn test_policy_honors_override() {
    let mut config = SyncConfig::default();
    assert_eq!(RetryPolicy::for_source(&descriptor(), &config).max_retries, 3);
    config.max_retries_override = Some(0);
    assert_eq!(RetryPolicy::for_source(&descriptor(), &config).max_retries, 0);
  }

  #[tokio::test]
  async fn test_network_errors_exhaust_retries() {
    let controller = controller();
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = controller
      .attempt(&descriptor(), "gaza", policy(3, 1), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(FetchError::Network("down".into())) }
      })
      .await;

    let err = result.unwrap_err();
    assert_eq!(err.retries, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(controller.consecutive_failures("casualties"), 4);
  }

  #[tokio::test]
  async fn test_non_retryable_fails_immediately() {
    let controller = controller();
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = controller
      .attempt(&descriptor(), "gaza", policy(3, 1), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(FetchError::Parse("bad json".into())) }
      })
      .await;

    assert_eq!(result.unwrap_err().retries, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_success_after_failures_resets_counter() {
    let controller = controller();
    let calls = AtomicU32::new(0);

    let result = controller
      .attempt(&descriptor(), "gaza", policy(3, 1), || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n < 2 {
            Err(FetchError::Network("flaky".into()))
          } else {
            Ok(n)
          }
        }
      })
      .await;

    assert_eq!(result, Ok(2));
    assert_eq!(controller.consecutive_failures("casualties"), 0);
  }

  #[tokio::test]
  async fn test_cancel_backoff_retries_now() {
    let controller = Arc::new(controller());
    let calls = Arc::new(AtomicU32::new(0));

    let task = {
      let controller = Arc::clone(&controller);
      let calls = Arc::clone(&calls);
      tokio::spawn(async move {
        controller
          .attempt(&descriptor(), "gaza", policy(1, 60_000), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
              if n == 0 {
                Err(FetchError::Network("down".into()))
              } else {
                Ok(())
              }
            }
          })
          .await
      })
    };

    while controller.status.snapshot().phases.get("gaza") != Some(&Phase::Backoff) {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    controller.cancel_backoff("gaza");

    let result = tokio::time::timeout(Duration::from_secs(5), task)
      .await
      .expect("backoff was not cut short")
      .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_cancel_during_fetch_skips_next_backoff() {
    let controller = controller();
    let calls = AtomicU32::new(0);

    let result = tokio::time::timeout(
      Duration::from_secs(5),
      controller.attempt(&descriptor(), "gaza", policy(1, 60_000), || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
          // Arrives before the key has entered its backoff wait
          controller.cancel_backoff("gaza");
        }
        async move {
          if n == 0 {
            Err(FetchError::Network("down".into()))
          } else {
            Ok(())
          }
        }
      }),
    )
    .await
    .expect("cancel issued during the fetch was lost");

    assert_eq!(result, Ok(()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_shutdown_cancels_backoff() {
    let shutdown = CancellationToken::new();
    let controller = RetryController::new(
      Arc::new(StatusTracker::new(Vec::new(), 20)),
      shutdown.clone(),
    );
    shutdown.cancel();

    let result: Result<(), _> = controller
      .attempt(&descriptor(), "gaza", policy(3, 60_000), || async {
        Err(FetchError::Network("down".into()))
      })
      .await;

    assert_eq!(result.unwrap_err().error, FetchError::Cancelled);
  }
}
