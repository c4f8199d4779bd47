//! In-memory cache layer with optional write-through persistence.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::traits::{CacheEntry, CacheStorage};

/// Key → entry store consulted by every read.
///
/// Reads never touch the persistent backend. Writes are applied in memory
/// immediately and handed, in order, to a dedicated writer thread, so the
/// async refresh path never blocks on disk I/O. Dropping the store flushes
/// pending writes.
pub struct CacheStore {
  entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
  writer: Option<Writer>,
}

enum WriteOp {
  Store(Arc<CacheEntry>),
  Remove(Option<String>),
}

struct Writer {
  tx: Option<mpsc::UnboundedSender<WriteOp>>,
  thread: Option<JoinHandle<()>>,
}

impl Writer {
  fn spawn(storage: Arc<dyn CacheStorage>) -> std::io::Result<Self> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let thread = std::thread::Builder::new()
      .name("cache-writer".to_string())
      .spawn(move || {
        while let Some(op) = rx.blocking_recv() {
          match op {
            WriteOp::Store(entry) => {
              if let Err(e) = storage.store(&entry) {
                warn!(key = %entry.key, error = %e, "Failed to persist cache entry");
              }
            }
            WriteOp::Remove(key) => {
              if let Err(e) = storage.remove(key.as_deref()) {
                warn!(error = %e, "Failed to clear persisted cache");
              }
            }
          }
        }
      })?;

    Ok(Self {
      tx: Some(tx),
      thread: Some(thread),
    })
  }

  fn send(&self, op: WriteOp) {
    let sent = self.tx.as_ref().map(|tx| tx.send(op).is_ok());
    if sent != Some(true) {
      warn!("Cache writer is gone, dropping write");
    }
  }
}

impl Drop for Writer {
  fn drop(&mut self) {
    // Closing the channel lets the thread drain and exit
    self.tx.take();
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        error!("Cache writer thread panicked");
      }
    }
  }
}

impl CacheStore {
  /// Create a store that lives only in memory.
  pub fn in_memory() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      writer: None,
    }
  }

  /// Create a store backed by `storage`, loading everything it already holds.
  pub fn with_storage(storage: Arc<dyn CacheStorage>) -> Self {
    let entries: HashMap<_, _> = match storage.load_all() {
      Ok(entries) => entries
        .into_iter()
        .map(|e| (e.key.clone(), Arc::new(e)))
        .collect(),
      Err(e) => {
        warn!(error = %e, "Failed to hydrate cache from storage, starting empty");
        HashMap::new()
      }
    };
    debug!(count = entries.len(), "Hydrated cache");

    let writer = match Writer::spawn(storage) {
      Ok(writer) => Some(writer),
      Err(e) => {
        error!(error = %e, "Failed to start cache writer, persistence disabled");
        None
      }
    };

    Self {
      entries: RwLock::new(entries),
      writer,
    }
  }

  pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
    self.entries.read().get(key).cloned()
  }

  /// Replace the entry for its key.
  ///
  /// Returns `false` and keeps the current entry when it was fetched later
  /// than `entry`.
  pub fn put(&self, entry: impl Into<Arc<CacheEntry>>) -> bool {
    let entry = entry.into();
    {
      let mut entries = self.entries.write();
      if let Some(current) = entries.get(&entry.key) {
        if current.fetched_at > entry.fetched_at {
          debug!(key = %entry.key, "Ignoring out-of-order cache write");
          return false;
        }
      }
      entries.insert(entry.key.clone(), Arc::clone(&entry));
      // Queued under the lock so the writer sees puts and clears in memory order
      if let Some(writer) = &self.writer {
        writer.send(WriteOp::Store(entry));
      }
    }
    true
  }

  pub fn is_fresh(&self, key: &str) -> bool {
    self
      .get(key)
      .map(|e| e.is_fresh_at(Utc::now()))
      .unwrap_or(false)
  }

  /// Drop one key, or everything when `key` is `None`.
  pub fn clear(&self, key: Option<&str>) {
    let mut entries = self.entries.write();
    match key {
      Some(key) => {
        entries.remove(key);
      }
      None => entries.clear(),
    }
    if let Some(writer) = &self.writer {
      writer.send(WriteOp::Remove(key.map(String::from)));
    }
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
    keys.sort();
    keys
  }
}
