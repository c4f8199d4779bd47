//! Consumer-facing facade tying cache, fetcher, retries and status together.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::bus::{Subscription, SubscriptionBus, SyncEvent};
use super::inflight::InFlightRegistry;
use super::retry::{AttemptError, RetryController, RetryPolicy};
use super::scheduler::{self, SchedulerHandle};
use super::status::{RefreshStatus, StatusTracker};
use crate::cache::{CacheEntry, CacheStore, Payload, SqliteStorage};
use crate::config::{Config, ConfigUpdate, SourceDescriptor, SyncConfig};
use crate::error::{FetchError, RefreshError, SyncError};
use crate::event::{EventHandler, WakeReason, WakeSignal};
use crate::fetch::{FsBlobStore, ReqwestClient, SourceFetcher};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

type RefreshResult = Result<Arc<CacheEntry>, RefreshError>;

/// Stale-while-revalidate access to every configured dataset.
///
/// Reads are answered from the cache without waiting. Refreshes happen on
/// the scheduler's tick, on [`SyncService::force_update`] and on external
/// wake signals, and are reported through [`SyncService::status`] and
/// subscriptions.
#[derive(Clone)]
pub struct SyncService {
  inner: Arc<Inner>,
}

struct Inner {
  descriptors: BTreeMap<String, Arc<SourceDescriptor>>,
  /// Dataset key -> id of the source serving it
  key_sources: BTreeMap<String, String>,
  store: CacheStore,
  fetcher: SourceFetcher,
  retry: RetryController,
  inflight: InFlightRegistry<RefreshResult>,
  status: Arc<StatusTracker>,
  bus: SubscriptionBus,
  config: watch::Sender<SyncConfig>,
  limiter: Semaphore,
  shutdown: CancellationToken,
  /// Taken by the scheduler on start
  events: Mutex<Option<EventHandler>>,
  wake: WakeSignal,
}

impl SyncService {
  pub fn new(config: &Config, store: CacheStore, fetcher: SourceFetcher) -> Self {
    let mut descriptors = BTreeMap::new();
    let mut key_sources = BTreeMap::new();
    for source in &config.sources {
      for key in source.keys() {
        key_sources.insert(key, source.id.clone());
      }
      descriptors.insert(source.id.clone(), Arc::new(source.clone()));
    }

    let permits = config
      .sync
      .max_concurrency
      .unwrap_or(key_sources.len())
      .max(1);
    let status = Arc::new(StatusTracker::new(
      key_sources.keys().cloned(),
      config.sync.max_errors,
    ));
    let shutdown = CancellationToken::new();
    let events = EventHandler::new();
    let wake = events.sender();
    let (config_tx, _) = watch::channel(config.sync.clone());

    debug!(
      sources = descriptors.len(),
      keys = key_sources.len(),
      permits,
      "Sync service created"
    );

    Self {
      inner: Arc::new(Inner {
        descriptors,
        key_sources,
        store,
        fetcher,
        retry: RetryController::new(Arc::clone(&status), shutdown.clone()),
        inflight: InFlightRegistry::new(),
        status,
        bus: SubscriptionBus::new(),
        config: config_tx,
        limiter: Semaphore::new(permits),
        shutdown,
        events: Mutex::new(Some(events)),
        wake,
      }),
    }
  }

  /// Build the production service: SQLite-backed cache, snapshots from
  /// `sync.snapshot_root`, remote fetches over HTTPS.
  pub fn from_config(config: &Config) -> Result<Self> {
    let store = if config.sync.persist {
      let path = config.cache_path()?;
      info!(path = %path.display(), "Opening persistent cache");
      CacheStore::with_storage(Arc::new(SqliteStorage::open(&path)?))
    } else {
      CacheStore::in_memory()
    };

    let base_url = config
      .sync
      .base_url
      .as_deref()
      .map(Url::parse)
      .transpose()
      .map_err(|e| eyre!("Invalid base_url: {}", e))?;
    let http =
      ReqwestClient::new(HTTP_TIMEOUT).map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    let blobs = FsBlobStore::new(config.sync.snapshot_root.clone());

    let fetcher = SourceFetcher::new(Arc::new(blobs), Arc::new(http)).with_base_url(base_url);
    Ok(Self::new(config, store, fetcher))
  }

  /// Spawn the refresh scheduler. Its first tick loads every stale or
  /// missing key.
  pub fn start(&self) -> Result<SchedulerHandle, SyncError> {
    if self.inner.shutdown.is_cancelled() {
      return Err(SyncError::Disposed);
    }
    let events = self
      .inner
      .events
      .lock()
      .take()
      .ok_or(SyncError::AlreadyStarted)?;

    info!(keys = self.inner.key_sources.len(), "Starting refresh scheduler");
    Ok(scheduler::spawn(self.clone(), events))
  }

  /// Stop the scheduler and abort pending backoff waits. Cached data stays readable.
  pub fn dispose(&self) {
    if !self.inner.shutdown.is_cancelled() {
      info!("Disposing sync service");
      self.inner.shutdown.cancel();
    }
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.shutdown.is_cancelled()
  }

  /// Cached payload for `key`, fresh or stale. Never waits on a fetch.
  pub fn get_cached_data(&self, key: &str) -> Option<Payload> {
    self.inner.store.get(key).map(|entry| entry.payload.clone())
  }

  pub fn get_entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
    self.inner.store.get(key)
  }

  /// Register `callback` for updates and failures, optionally only for `key`.
  pub fn subscribe<F>(&self, callback: F, key: Option<&str>) -> Subscription
  where
    F: Fn(&SyncEvent) + Send + Sync + 'static,
  {
    self.inner.bus.subscribe(callback, key)
  }

  /// Refresh now, ignoring freshness.
  ///
  /// `sources` may name source ids (all of their keys) or individual keys;
  /// `None` refreshes everything. Keys waiting in backoff retry right away.
  /// Keys already being fetched are joined rather than fetched twice.
  pub async fn force_update(
    &self,
    sources: Option<&[&str]>,
  ) -> Result<BTreeMap<String, Payload>, SyncError> {
    if self.is_disposed() {
      return Err(SyncError::Disposed);
    }
    let keys = self.inner.resolve(sources)?;

    for key in &keys {
      self.inner.retry.cancel_backoff(key);
    }

    let results = join_all(keys.iter().map(|key| self.inner.refresh_key(key))).await;

    let mut payloads = BTreeMap::new();
    let mut failures = Vec::new();
    for (key, result) in keys.into_iter().zip(results) {
      match result {
        Ok(entry) => {
          payloads.insert(key, entry.payload.clone());
        }
        Err(e) => failures.push(e),
      }
    }

    if failures.is_empty() {
      Ok(payloads)
    } else {
      Err(SyncError::Refresh(failures))
    }
  }

  /// Start background refreshes for keys that are stale or missing and not
  /// already being fetched. Returns how many were started.
  pub fn refresh_due(&self) -> usize {
    if self.is_disposed() {
      return 0;
    }

    let due: Vec<String> = self
      .inner
      .key_sources
      .keys()
      .filter(|key| !self.inner.store.is_fresh(key) && !self.inner.inflight.is_running(key))
      .cloned()
      .collect();

    for key in &due {
      let inner = Arc::clone(&self.inner);
      let key = key.clone();
      tokio::spawn(async move {
        let _ = inner.refresh_key(&key).await;
      });
    }

    if !due.is_empty() {
      debug!(count = due.len(), "Refreshing due keys");
    }
    due.len()
  }

  /// Best-effort refresh of everything, not awaited.
  pub fn wake(&self, reason: WakeReason) {
    info!(?reason, "Wake signal received");
    let service = self.clone();
    tokio::spawn(async move {
      if let Err(e) = service.force_update(None).await {
        warn!(?reason, error = %e, "Wake refresh incomplete");
      }
    });
  }

  /// Handle for integrations that want to trigger refreshes or report
  /// connectivity. Events are only processed while the scheduler runs.
  pub fn wake_signal(&self) -> WakeSignal {
    self.inner.wake.clone()
  }

  pub fn status(&self) -> RefreshStatus {
    self.inner.status.snapshot()
  }

  pub fn clear_errors(&self) {
    self.inner.status.clear_errors();
  }

  /// Drop one cached key, or all of them. Persisted rows go too.
  pub fn clear_cache(&self, key: Option<&str>) {
    info!(key, "Clearing cache");
    self.inner.store.clear(key);
  }

  /// Adjust runtime settings. A new refresh interval re-arms the scheduler.
  pub fn update_config(&self, update: ConfigUpdate) {
    self.inner.config.send_modify(|config| config.apply(&update));
    if let Some(max_errors) = update.max_errors {
      self.inner.status.set_max_errors(max_errors);
    }
    info!(?update, "Configuration updated");
  }

  pub fn config(&self) -> SyncConfig {
    self.inner.config.borrow().clone()
  }

  pub fn consecutive_failures(&self, source: &str) -> u32 {
    self.inner.retry.consecutive_failures(source)
  }

  /// All configured dataset keys, sorted.
  pub fn keys(&self) -> Vec<String> {
    self.inner.key_sources.keys().cloned().collect()
  }

  pub(super) fn shutdown_token(&self) -> CancellationToken {
    self.inner.shutdown.clone()
  }

  pub(super) fn watch_config(&self) -> watch::Receiver<SyncConfig> {
    self.inner.config.subscribe()
  }

  pub(super) fn tracker(&self) -> &StatusTracker {
    &self.inner.status
  }
}

impl Inner {
  /// Expand source ids and keys into a deduplicated key list.
  fn resolve(&self, names: Option<&[&str]>) -> Result<Vec<String>, SyncError> {
    let Some(names) = names else {
      return Ok(self.key_sources.keys().cloned().collect());
    };

    let mut keys: Vec<String> = Vec::new();
    for name in names {
      let expanded = if let Some(descriptor) = self.descriptors.get(*name) {
        descriptor.keys()
      } else if self.key_sources.contains_key(*name) {
        vec![name.to_string()]
      } else {
        return Err(SyncError::UnknownSource(name.to_string()));
      };

      for key in expanded {
        if !keys.contains(&key) {
          keys.push(key);
        }
      }
    }
    Ok(keys)
  }

  /// Fetch `key` unless a fetch for it is already running, in which case its
  /// result is shared.
  async fn refresh_key(self: &Arc<Self>, key: &str) -> RefreshResult {
    let (source, descriptor) = match self
      .key_sources
      .get(key)
      .and_then(|id| self.descriptors.get(id).map(|d| (id.clone(), Arc::clone(d))))
    {
      Some(found) => found,
      None => {
        return Err(RefreshError::new(
          "",
          key,
          &FetchError::NotFound(format!("unknown key {}", key)),
          0,
        ))
      }
    };

    let inner = Arc::clone(self);
    let owned_key = key.to_string();
    let shared = self
      .inflight
      .run_exclusive(key, move || async move {
        inner.fetch_and_store(&descriptor, &owned_key).await
      })
      .await;

    shared.unwrap_or_else(|| {
      Err(RefreshError::new(
        &source,
        key,
        &FetchError::Internal("refresh task panicked".to_string()),
        0,
      ))
    })
  }

  async fn fetch_and_store(&self, descriptor: &SourceDescriptor, key: &str) -> RefreshResult {
    self.status.begin(key);
    let mut cycle = CycleGuard {
      status: &self.status,
      source: &descriptor.id,
      key,
      settled: false,
    };

    let policy = RetryPolicy::for_source(descriptor, &self.config.borrow());
    let limiter = &self.limiter;
    let fetcher = &self.fetcher;
    let result = self
      .retry
      .attempt(descriptor, key, policy, move || async move {
        // Held for the fetch only, never across a backoff wait
        let _permit = limiter.acquire().await.map_err(|_| FetchError::Cancelled)?;
        fetcher.fetch(descriptor, key).await
      })
      .await;

    let outcome = match result {
      Ok(fetched) => {
        let entry = Arc::new(CacheEntry::new(
          key,
          &descriptor.id,
          fetched.origin,
          fetched.payload,
          Utc::now(),
          descriptor.ttl(),
        ));
        self.status.record_success(&descriptor.id, key);

        if self.store.put(Arc::clone(&entry)) {
          info!(source = %descriptor.id, key, origin = entry.origin.as_str(), "Dataset updated");
          self.bus.publish(&SyncEvent::Updated {
            key: entry.key.clone(),
            source: entry.source_id.clone(),
            origin: entry.origin,
            fetched_at: entry.fetched_at,
          });
          Ok(entry)
        } else {
          Ok(self.store.get(key).unwrap_or(entry))
        }
      }
      Err(AttemptError { error, retries }) => {
        let error_record = RefreshError::new(&descriptor.id, key, &error, retries);
        if error == FetchError::Cancelled {
          debug!(source = %descriptor.id, key, "Refresh cancelled");
        } else {
          self.status.record_error(error_record.clone());
          self.bus.publish(&SyncEvent::Failed(error_record.clone()));
        }
        Err(error_record)
      }
    };

    cycle.settled = true;
    outcome
  }
}

/// Closes a key's refresh cycle even if the fetch unwinds or is dropped.
struct CycleGuard<'a> {
  status: &'a StatusTracker,
  source: &'a str,
  key: &'a str,
  /// Set once an outcome was recorded normally
  settled: bool,
}

impl Drop for CycleGuard<'_> {
  fn drop(&mut self) {
    if !self.settled {
      self.status.record_error(RefreshError::new(
        self.source,
        self.key,
        &FetchError::Internal("refresh task panicked".to_string()),
        0,
      ));
    }
    self.status.finish(self.key);
  }
}
