//! Deduplication of concurrent fetches for the same key.

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

type Computation<T> = Shared<oneshot::Receiver<T>>;
type ComputationMap<T> = Arc<Mutex<HashMap<String, Computation<T>>>>;

/// Runs at most one computation per key at a time.
///
/// The first caller for a key spawns the work; callers arriving while it is
/// running share its result. The key is released before the result is
/// delivered, so a request made after completion starts a new computation.
pub struct InFlightRegistry<T> {
  current: ComputationMap<T>,
}

impl<T> Clone for InFlightRegistry<T> {
  fn clone(&self) -> Self {
    Self {
      current: Arc::clone(&self.current),
    }
  }
}

impl<T> Default for InFlightRegistry<T> {
  fn default() -> Self {
    Self {
      current: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> InFlightRegistry<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `make()` for `key` unless a computation for it is already running.
  ///
  /// `make` is only invoked by the caller that starts the computation. The
  /// work runs on its own task and completes even if every caller goes away.
  /// Returns `None` only if that task panicked.
  pub async fn run_exclusive<F, Fut>(&self, key: &str, make: F) -> Option<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T> + Send + 'static,
  {
    let channel = {
      let mut current = self.current.lock();
      if let Some(channel) = current.get(key) {
        tracing::trace!(key, "Joining in-flight fetch");
        channel.clone()
      } else {
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        current.insert(key.to_string(), channel.clone());

        let future = make();
        let map = Arc::clone(&self.current);
        let owned_key = key.to_string();
        tokio::spawn(async move {
          let result = CleanupOnDrop {
            map: &map,
            key: &owned_key,
          }
          .run(future)
          .await;
          let _ = sender.send(result);
        });

        channel
      }
    };

    channel.await.ok()
  }

  pub fn is_running(&self, key: &str) -> bool {
    self.current.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.current.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Removes the registry entry when the computation finishes or unwinds.
struct CleanupOnDrop<'a, T> {
  map: &'a Mutex<HashMap<String, Computation<T>>>,
  key: &'a str,
}

impl<T> CleanupOnDrop<'_, T> {
  async fn run<Fut: Future<Output = T>>(self, future: Fut) -> T {
    future.await
  }
}

impl<T> Drop for CleanupOnDrop<'_, T> {
  fn drop(&mut self) {
    self.map.lock().remove(self.key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_concurrent_callers_share_one_computation() {
    let registry = InFlightRegistry::<usize>::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let callers = (0..10).map(|_| {
      let registry = registry.clone();
      let runs = Arc::clone(&runs);
      async move {
        registry
          .run_exclusive("gaza-casualties", move || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            runs.fetch_add(1, Ordering::SeqCst) + 100
          })
          .await
      }
    });
    let results = futures::future::join_all(callers).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| *r == Some(100)));
    assert!(registry.is_empty());
  }

  #[tokio::test]
  async fn test_sequential_calls_run_again() {
    let registry = InFlightRegistry::<u32>::new();
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
      let runs = Arc::clone(&runs);
      registry
        .run_exclusive("k", move || async move {
          runs.fetch_add(1, Ordering::SeqCst);
          1
        })
        .await;
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_distinct_keys_do_not_coalesce() {
    let registry = InFlightRegistry::<&'static str>::new();
    let (a, b) = tokio::join!(
      registry.run_exclusive("a", || async { "a" }),
      registry.run_exclusive("b", || async { "b" }),
    );
    assert_eq!((a, b), (Some("a"), Some("b")));
  }

  #[tokio::test]
  async fn test_panicking_computation_is_released() {
    let registry = InFlightRegistry::<u32>::new();
    let result = registry
      .run_exclusive("k", || async {
        if true {
          panic!("boom");
        }
        0
      })
      .await;

    assert_eq!(result, None);
    assert!(!registry.is_running("k"));
  }

  #[tokio::test]
  async fn test_is_running_while_in_flight() {
    let registry = InFlightRegistry::<u32>::new();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = {
      let registry = registry.clone();
      tokio::spawn(async move {
        registry
          .run_exclusive("k", || async move {
            let _ = rx.await;
            7
          })
          .await
      })
    };

    while !registry.is_running("k") {
      tokio::task::yield_now().await;
    }
    tx.send(()).unwrap();
    assert_eq!(handle.await.unwrap(), Some(7));
    assert!(!registry.is_running("k"));
  }
}
