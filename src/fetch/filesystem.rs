//! Local snapshots stored on the filesystem.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::BlobStore;

/// Blob store rooted at a snapshot directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
  root: PathBuf,
}

impl FsBlobStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Resolve `path` under the root. Absolute paths and `..` are refused.
  fn resolve(&self, path: &str) -> Option<PathBuf> {
    let relative = Path::new(path);
    let contained = relative
      .components()
      .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    contained.then(|| self.root.join(relative))
  }
}

#[async_trait]
impl BlobStore for FsBlobStore {
  async fn read(&self, path: &str) -> io::Result<Option<Bytes>> {
    let Some(full_path) = self.resolve(path) else {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("snapshot path escapes the snapshot root: {}", path),
      ));
    };

    match tokio::fs::read(&full_path).await {
      Ok(data) => Ok(Some(Bytes::from(data))),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_read_existing_and_missing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("casualties")).unwrap();
    std::fs::write(dir.path().join("casualties/gaza.json"), "[1]").unwrap();

    let store = FsBlobStore::new(dir.path());
    let data = store.read("casualties/gaza.json").await.unwrap();
    assert_eq!(data.as_deref(), Some(&b"[1]"[..]));

    assert!(store.read("casualties/missing.json").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_rejects_escaping_paths() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());

    assert!(store.read("../etc/passwd").await.is_err());
    assert!(store.read("/etc/passwd").await.is_err());
  }
}
