//! Blob store contract and filesystem implementation
//!
//! Layout under the media root:
//! `datasets/{owner}/{content_hash}`, `images/{owner}/{run}/{index}.{fmt}`,
//! `reports/{owner}/{id}.docx`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::types::StoreError;

/// Blob collaborator contract.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob at a store-relative path, creating parents.
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Fetch a blob.
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Remove a blob. Returns whether it existed.
    async fn delete(&self, path: &str) -> Result<bool, StoreError>;

    /// Store-relative paths under `prefix` last modified more than
    /// `age` ago.
    async fn list_older_than(&self, prefix: &str, age: Duration)
        -> Result<Vec<String>, StoreError>;

    /// Whether the store root is present and readable.
    async fn is_readable(&self) -> bool;
}

/// Filesystem-backed blob store rooted at a media directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        // Store-relative paths only; reject traversal out of the root.
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StoreError::Io(format!("invalid blob path: {}", path)));
        }
        Ok(self.root.join(rel))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn list_older_than(
        &self,
        prefix: &str,
        age: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let base = self.resolve(prefix)?;
        if !base.exists() {
            return Ok(Vec::new());
        }
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut stale = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                if meta.is_dir() {
                    stack.push(path);
                } else if meta.modified().map(|m| m < cutoff).unwrap_or(false) {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        stale.push(rel.to_string_lossy().into_owned());
                    }
                }
            }
        }
        Ok(stale)
    }

    async fn is_readable(&self) -> bool {
        tokio::fs::read_dir(&self.root).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.put("datasets/u1/abc", b"payload").await.unwrap();
        assert_eq!(store.get("datasets/u1/abc").await.unwrap(), b"payload");
        assert!(store.delete("datasets/u1/abc").await.unwrap());
        assert!(matches!(
            store.get("datasets/u1/abc").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        assert!(store.put("../outside", b"x").await.is_err());
    }

    #[tokio::test]
    async fn lists_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.put("images/u1/r1/1.png", b"img").await.unwrap();
        let fresh = store
            .list_older_than("images", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(fresh.is_empty());
        let stale = store
            .list_older_than("images", Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }
}
