//! Persisted blob tier: one blob per cache key, named by a hash of the key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<()>;
    /// Returns whether a blob was removed.
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// In-process blob store, for tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(name).is_some())
    }
}

/// Blobs as `<root>/<name>.json` files. Writes go through a temp file and a
/// rename so a crash never leaves a partial blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;
        let path = self.path(name);
        let tmp = self.root.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }
}
