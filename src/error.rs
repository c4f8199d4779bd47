//! Error types shared by the fetch and sync layers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Classification of a failed fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
  Network,
  NotFound,
  Parse,
  Validation,
  Cancelled,
  Internal,
}

/// A failed attempt to resolve a dataset from its local snapshot or remote endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Transport failure or non-success HTTP status. Retryable.
  #[error("network error: {0}")]
  Network(String),
  /// Neither the local snapshot nor the remote endpoint has the dataset.
  #[error("not found: {0}")]
  NotFound(String),
  /// The payload is not valid JSON.
  #[error("parse error: {0}")]
  Parse(String),
  /// The payload parsed but does not have the expected shape.
  #[error("validation error: {0}")]
  Validation(String),
  /// The service was disposed while the fetch was waiting.
  #[error("fetch cancelled")]
  Cancelled,
  /// The refresh task itself failed, e.g. it panicked.
  #[error("internal error: {0}")]
  Internal(String),
}

impl FetchError {
  pub fn kind(&self) -> FetchErrorKind {
    match self {
      Self::Network(_) => FetchErrorKind::Network,
      Self::NotFound(_) => FetchErrorKind::NotFound,
      Self::Parse(_) => FetchErrorKind::Parse,
      Self::Validation(_) => FetchErrorKind::Validation,
      Self::Cancelled => FetchErrorKind::Cancelled,
      Self::Internal(_) => FetchErrorKind::Internal,
    }
  }

  /// Only transient transport failures are worth another attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Network(_))
  }
}

/// A terminal failure for one key in one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshError {
  pub source: String,
  pub key: String,
  pub kind: FetchErrorKind,
  pub message: String,
  pub occurred_at: DateTime<Utc>,
  /// Retries spent before giving up (attempts - 1)
  pub retry_count: u32,
}

impl RefreshError {
  pub fn new(source: &str, key: &str, error: &FetchError, retry_count: u32) -> Self {
    Self {
      source: source.to_string(),
      key: key.to_string(),
      kind: error.kind(),
      message: error.to_string(),
      occurred_at: Utc::now(),
      retry_count,
    }
  }
}

impl std::fmt::Display for RefreshError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{}/{} failed after {} retries: {}",
      self.source, self.key, self.retry_count, self.message
    )
  }
}

/// Errors returned to callers of the sync service.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
  #[error("unknown source: {0}")]
  UnknownSource(String),
  #[error("sync service has been disposed")]
  Disposed,
  #[error("refresh scheduler is already running")]
  AlreadyStarted,
  #[error("{} refresh(es) failed: {}", .0.len(), summarize(.0))]
  Refresh(Vec<RefreshError>),
}

fn summarize(errors: &[RefreshError]) -> String {
  errors
    .iter()
    .map(|e| e.to_string())
    .collect::<Vec<_>>()
    .join("; ")
}
