//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::FetchError;

/// A parsed dataset. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload(Arc<Value>);

/// Optional metadata envelope carried by datasets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMeta {
  pub source: Option<String>,
  pub dataset: Option<String>,
  pub record_count: Option<u64>,
  pub last_updated: Option<String>,
}

impl Payload {
  /// Parse raw bytes into a payload.
  ///
  /// Datasets are JSON objects or arrays; anything else is a validation failure,
  /// as is a `metadata` field that does not match the envelope shape.
  pub fn parse(bytes: &[u8]) -> Result<Self, FetchError> {
    let value: Value =
      serde_json::from_slice(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
    Self::from_value(value)
  }

  pub fn from_value(value: Value) -> Result<Self, FetchError> {
    match &value {
      Value::Object(map) => {
        if let Some(meta) = map.get("metadata") {
          PayloadMeta::deserialize(meta)
            .map_err(|e| FetchError::Validation(format!("malformed metadata: {}", e)))?;
        }
      }
      Value::Array(_) => {}
      other => {
        return Err(FetchError::Validation(format!(
          "expected a JSON object or array, got {}",
          json_type(other)
        )))
      }
    }
    Ok(Self(Arc::new(value)))
  }

  pub fn value(&self) -> &Value {
    &self.0
  }

  /// The metadata envelope, if the dataset carries one.
  pub fn metadata(&self) -> Option<PayloadMeta> {
    self
      .0
      .get("metadata")
      .and_then(|m| PayloadMeta::deserialize(m).ok())
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    // Serializing a Value cannot fail
    serde_json::to_vec(self.0.as_ref()).unwrap_or_default()
  }
}

fn json_type(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

/// Where a cached payload was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Pre-built snapshot shipped with the application
  LocalSnapshot,
  /// Live remote endpoint
  Remote,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::LocalSnapshot => "local_snapshot",
      Self::Remote => "remote",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "local_snapshot" => Some(Self::LocalSnapshot),
      "remote" => Some(Self::Remote),
      _ => None,
    }
  }
}

/// A cached dataset with freshness metadata. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
  pub key: String,
  /// Id of the source descriptor that produced this entry
  pub source_id: String,
  pub origin: CacheSource,
  pub payload: Payload,
  pub fetched_at: DateTime<Utc>,
  pub stale_at: DateTime<Utc>,
  /// Hex SHA-256 of the serialized payload
  pub checksum: String,
}

impl CacheEntry {
  pub fn new(
    key: &str,
    source_id: &str,
    origin: CacheSource,
    payload: Payload,
    fetched_at: DateTime<Utc>,
    ttl: chrono::Duration,
  ) -> Self {
    let checksum = checksum(&payload.to_bytes());
    Self {
      key: key.to_string(),
      source_id: source_id.to_string(),
      origin,
      payload,
      fetched_at,
      stale_at: fetched_at
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
      checksum,
    }
  }

  pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
    now < self.stale_at
  }

  pub fn is_fresh(&self) -> bool {
    self.is_fresh_at(Utc::now())
  }
}

pub fn checksum(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

/// Durable backing for the in-memory cache.
pub trait CacheStorage: Send + Sync {
  /// Load every persisted entry.
  fn load_all(&self) -> Result<Vec<CacheEntry>>;

  /// Persist an entry unless a newer one is already stored for its key.
  fn store(&self, entry: &CacheEntry) -> Result<()>;

  /// Remove one key, or everything when `key` is `None`.
  fn remove(&self, key: Option<&str>) -> Result<()>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_object_with_metadata() {
    let payload = Payload::parse(
      br#"{"metadata":{"source":"moh","dataset":"casualties","recordCount":2,"lastUpdated":"2024-01-01"},"data":[1,2]}"#,
    )
    .unwrap();
    let meta = payload.metadata().unwrap();
    assert_eq!(meta.record_count, Some(2));
    assert_eq!(meta.dataset.as_deref(), Some("casualties"));
  }

  #[test]
  fn test_parse_rejects_invalid_json() {
    assert!(matches!(Payload::parse(b"{not json"), Err(FetchError::Parse(_))));
  }

  #[test]
  fn test_parse_rejects_scalars() {
    assert!(matches!(Payload::parse(b"42"), Err(FetchError::Validation(_))));
    assert!(matches!(Payload::parse(b"null"), Err(FetchError::Validation(_))));
  }

  #[test]
  fn test_entry_serializes_payload_inline() {
    let entry = CacheEntry::new(
      "gaza",
      "casualties",
      CacheSource::Remote,
      Payload::from_value(json!({"data": [1]})).unwrap(),
      Utc::now(),
      chrono::Duration::seconds(60),
    );
    let value = serde_json::to_value(&entry).unwrap();
    assert_eq!(value["payload"], json!({"data": [1]}));
    assert_eq!(value["origin"], json!("remote"));
  }

  #[test]
  fn test_huge_ttl_saturates_stale_at() {
    let entry = CacheEntry::new(
      "archive",
      "archive",
      CacheSource::LocalSnapshot,
      Payload::from_value(json!([])).unwrap(),
      Utc::now(),
      chrono::Duration::MAX,
    );
    assert_eq!(entry.stale_at, DateTime::<Utc>::MAX_UTC);
    assert!(entry.is_fresh());
  }

  #[test]
  fn test_parse_rejects_malformed_metadata() {
    let result = Payload::parse(br#"{"metadata":{"recordCount":"many"}}"#);
    assert!(matches!(result, Err(FetchError::Validation(_))));
  }

  #[test]
  fn test_entry_freshness() {
    let payload = Payload::from_value(json!([1])).unwrap();
    let now = Utc::now();
    let entry = CacheEntry::new(
      "k",
      "s",
      CacheSource::Remote,
      payload,
      now,
      chrono::Duration::seconds(10),
    );
    assert!(entry.is_fresh_at(now));
    assert!(!entry.is_fresh_at(now + chrono::Duration::seconds(10)));
    assert_eq!(entry.checksum.len(), 64);
  }
}
