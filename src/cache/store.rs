//! Durable key-value stores backing the cache's second tier
//!
//! The cache only needs `get`/`set`/`remove` on opaque bytes. Stores report
//! their own failures; the cache decides to log and carry on.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

/// Byte-oriented key-value store
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch the value stored under `key`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the store cannot be read.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the store cannot be written.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the store cannot be written.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

// ── In-memory ─────────────────────────────────────────────────────────

/// Process-local store, mainly for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is present
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ── Filesystem ────────────────────────────────────────────────────────

/// One file per key under a directory.
///
/// File names are the SHA-256 of the key, so any key string is safe to use.
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be created.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir).map_err(|e| {
                Error::Storage(format!(
                    "Failed to create cache dir {}: {e}",
                    base_dir.display()
                ))
            })?;
        }
        Ok(Self { base_dir })
    }

    /// Store in the default location (`~/.genai-gateway/cache`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the home directory is unknown or the
    /// directory cannot be created.
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Storage("Cannot determine home directory".to_string()))?;
        Self::new(home.join(".genai-gateway").join("cache"))
    }

    /// Directory holding the entries
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.base_dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read '{key}': {e}"))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write '{key}': {e}")))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Storage(format!("Failed to commit '{key}': {e}")));
        }
        debug!(key, path = %path.display(), "Stored durable entry");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to remove '{key}': {e}"))),
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.set("a", b"one").await.unwrap();
        store.set("a", b"two").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let key = "genai:post:abc/with:odd chars";

        FileStore::new(dir.path()).unwrap().set(key, b"payload").await.unwrap();

        let reopened = FileStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get(key).await.unwrap(), Some(b"payload".to_vec()));

        reopened.remove(key).await.unwrap();
        assert_eq!(reopened.get(key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = FileStore::new(&nested).unwrap();
        store.set("k", b"v").await.unwrap();
        assert!(nested.exists());
        assert_eq!(std::fs::read_dir(&nested).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert_eq!(store.get("absent").await.unwrap(), None);
        store.remove("absent").await.unwrap();
    }
}
