//! Fan-out of cache updates and refresh failures to subscribers.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

use crate::cache::CacheSource;
use crate::error::RefreshError;

/// Something a subscriber may want to react to.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// A cache entry was replaced
  Updated {
    key: String,
    source: String,
    origin: CacheSource,
    fetched_at: DateTime<Utc>,
  },
  /// A refresh failed terminally
  Failed(RefreshError),
}

impl SyncEvent {
  pub fn key(&self) -> &str {
    match self {
      Self::Updated { key, .. } => key,
      Self::Failed(error) => &error.key,
    }
  }
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Subscriber {
  callback: Callback,
  key_filter: Option<String>,
}

#[derive(Default)]
struct Registry {
  next_id: AtomicU64,
  subscribers: RwLock<BTreeMap<u64, Subscriber>>,
}

/// Dispatches [`SyncEvent`]s to registered callbacks.
#[derive(Default, Clone)]
pub struct SubscriptionBus {
  registry: Arc<Registry>,
}

impl SubscriptionBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `callback`, optionally only for events about `key_filter`.
  pub fn subscribe<F>(&self, callback: F, key_filter: Option<&str>) -> Subscription
  where
    F: Fn(&SyncEvent) + Send + Sync + 'static,
  {
    let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
    self.registry.subscribers.write().insert(
      id,
      Subscriber {
        callback: Arc::new(callback),
        key_filter: key_filter.map(String::from),
      },
    );

    Subscription {
      id,
      registry: Arc::downgrade(&self.registry),
    }
  }

  /// Call every matching subscriber once. Panics in callbacks are logged and swallowed.
  pub fn publish(&self, event: &SyncEvent) {
    // Callbacks run outside the lock so they may (un)subscribe
    let targets: Vec<(u64, Callback)> = self
      .registry
      .subscribers
      .read()
      .iter()
      .filter(|(_, s)| s.key_filter.as_deref().map_or(true, |k| k == event.key()))
      .map(|(id, s)| (*id, Arc::clone(&s.callback)))
      .collect();

    for (id, callback) in targets {
      if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!(subscriber = id, key = event.key(), "Subscriber panicked while handling event");
      }
    }
  }

  pub fn len(&self) -> usize {
    self.registry.subscribers.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Handle for a registered subscriber. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  id: u64,
  registry: Weak<Registry>,
}

impl Subscription {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.subscribers.write().remove(&self.id);
    }
  }
}
