//! Resolution of datasets from local snapshots and remote endpoints.

mod filesystem;
mod http;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheSource, Payload};
use crate::config::SourceDescriptor;
use crate::error::FetchError;

pub use filesystem::FsBlobStore;
pub use http::ReqwestClient;

/// Read access to pre-generated snapshot blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
  /// Returns `Ok(None)` when nothing is stored at `path`.
  async fn read(&self, path: &str) -> std::io::Result<Option<Bytes>>;
}

/// Minimal HTTP GET used for the remote fallback.
#[async_trait]
pub trait HttpClient: Send + Sync {
  /// Returns the response body of a successful request.
  ///
  /// Implementations report a 404 as [`FetchError::NotFound`] and every other
  /// failure as [`FetchError::Network`].
  async fn get(&self, url: &Url) -> Result<Bytes, FetchError>;
}

/// A successfully resolved dataset.
#[derive(Debug, Clone)]
pub struct Fetched {
  pub payload: Payload,
  pub origin: CacheSource,
}

/// Local-first fetch strategy shared by all sources.
#[derive(Clone)]
pub struct SourceFetcher {
  blobs: Arc<dyn BlobStore>,
  http: Arc<dyn HttpClient>,
  base_url: Option<Url>,
}

impl SourceFetcher {
  pub fn new(blobs: Arc<dyn BlobStore>, http: Arc<dyn HttpClient>) -> Self {
    Self {
      blobs,
      http,
      base_url: None,
    }
  }

  /// Resolve relative remote endpoints against `base_url`.
  pub fn with_base_url(mut self, base_url: Option<Url>) -> Self {
    self.base_url = base_url;
    self
  }

  /// Fetch one dataset.
  ///
  /// 1. Read the local snapshot - if present and valid, return it
  /// 2. Otherwise call the remote endpoint
  /// 3. If that fails too, its error is returned
  pub async fn fetch(&self, descriptor: &SourceDescriptor, key: &str) -> Result<Fetched, FetchError> {
    let path = render(&descriptor.local_snapshot, &descriptor.id, key);

    match self.blobs.read(&path).await {
      Ok(Some(bytes)) => match Payload::parse(&bytes) {
        Ok(payload) => {
          debug!(source = %descriptor.id, key, %path, "Serving local snapshot");
          return Ok(Fetched {
            payload,
            origin: CacheSource::LocalSnapshot,
          });
        }
        Err(e) => {
          warn!(source = %descriptor.id, key, %path, error = %e, "Local snapshot unusable, falling back to remote");
        }
      },
      Ok(None) => {
        debug!(source = %descriptor.id, key, %path, "No local snapshot");
      }
      Err(e) => {
        warn!(source = %descriptor.id, key, %path, error = %e, "Failed to read local snapshot");
      }
    }

    let Some(template) = &descriptor.remote_endpoint else {
      return Err(FetchError::NotFound(format!(
        "no local snapshot at {} and no remote endpoint configured",
        path
      )));
    };

    let url = self.remote_url(template, &descriptor.id, key)?;
    debug!(source = %descriptor.id, key, %url, "Fetching from remote");

    let body = self.http.get(&url).await?;
    let payload = Payload::parse(&body)?;

    Ok(Fetched {
      payload,
      origin: CacheSource::Remote,
    })
  }

  fn remote_url(&self, template: &str, source: &str, key: &str) -> Result<Url, FetchError> {
    let rendered = render(template, source, key);

    let parsed = match Url::parse(&rendered) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
        Some(base) => base.join(&rendered),
        None => {
          return Err(FetchError::Validation(format!(
            "relative endpoint {} requires a base_url",
            rendered
          )))
        }
      },
      Err(e) => Err(e),
    };

    parsed.map_err(|e| FetchError::Validation(format!("invalid endpoint {}: {}", rendered, e)))
  }
}

/// Substitute `{source}` and `{key}` placeholders.
pub fn render(template: &str, source: &str, key: &str) -> String {
  template.replace("{source}", source).replace("{key}", key)
}

#[cfg(test)]
pub(crate) mod testing {
  //! In-memory collaborators for tests.

  use super::*;
  use parking_lot::Mutex;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Default)]
  pub struct MemoryBlobs {
    pub blobs: Mutex<HashMap<String, Bytes>>,
    pub reads: AtomicUsize,
  }

  impl MemoryBlobs {
    pub fn with(entries: &[(&str, &str)]) -> Self {
      let blobs = MemoryBlobs::default();
      for (path, body) in entries {
        blobs
          .blobs
          .lock()
          .insert(path.to_string(), Bytes::from(body.to_string()));
      }
      blobs
    }

    pub fn reads(&self) -> usize {
      self.reads.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl BlobStore for MemoryBlobs {
    async fn read(&self, path: &str) -> std::io::Result<Option<Bytes>> {
      self.reads.fetch_add(1, Ordering::SeqCst);
      Ok(self.blobs.lock().get(path).cloned())
    }
  }

  /// Scripted HTTP responses keyed by URL; unknown URLs are 404s.
  #[derive(Default)]
  pub struct FakeHttp {
    pub responses: Mutex<HashMap<String, Result<Bytes, FetchError>>>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
  }

  impl FakeHttp {
    pub fn respond(&self, url: &str, response: Result<&str, FetchError>) {
      self.responses.lock().insert(
        url.to_string(),
        response.map(|body| Bytes::from(body.to_string())),
      );
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    /// Most requests observed in flight at the same time.
    pub fn peak_active(&self) -> usize {
      self.peak_active.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl HttpClient for FakeHttp {
    async fn get(&self, url: &Url) -> Result<Bytes, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak_active.fetch_max(active, Ordering::SeqCst);
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      self.active.fetch_sub(1, Ordering::SeqCst);
      let response = self.responses.lock().get(url.as_str()).cloned();
      response.unwrap_or_else(|| Err(FetchError::NotFound(url.to_string())))
    }
  }
}
