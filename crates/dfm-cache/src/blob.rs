//! Blob store backends for large cache payloads.
//!
//! Values above the cache's inline threshold (images, arrays) are written to
//! a provider-configured blob store and recorded in the cache by URI. Blobs
//! are content-addressed: the URI embeds the SHA-256 of the bytes, so a
//! re-materialized artifact lands on the same name.

use async_trait::async_trait;
use dfm::config::{BlobProtocol, FsspecConf};
use dfm::error::{DfmError, Result};
use dfm::fingerprint::Fingerprint;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where adapter outputs are materialized.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning their URI.
    async fn store(&self, data: &[u8]) -> Result<String>;

    /// Fetch the bytes behind a URI.
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;

    async fn exists(&self, uri: &str) -> Result<bool>;

    async fn delete(&self, uri: &str) -> Result<()>;
}

/// Build the blob store a provider's `cache_fsspec_conf` describes.
///
/// No configuration means in-memory, which is also what tests use.
pub fn blob_store_for(conf: Option<&FsspecConf>) -> Result<Arc<dyn BlobStore>> {
    match conf {
        None => Ok(Arc::new(InMemoryBlobStore::new())),
        Some(conf) => match conf.protocol {
            BlobProtocol::Memory => Ok(Arc::new(InMemoryBlobStore::new())),
            BlobProtocol::File => {
                let root = conf.base_path.clone().ok_or_else(|| {
                    DfmError::Config(
                        "cache_fsspec_conf with protocol 'file' needs base_path".to_string(),
                    )
                })?;
                Ok(Arc::new(LocalDirStore::new(root)))
            }
        },
    }
}

fn content_name(data: &[u8]) -> String {
    Fingerprint::from_bytes(data).to_hex()
}

/// Local-directory blob store (`file://` URIs).
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| DfmError::Cache(format!("not a file blob URI: '{uri}'")))?;
        Ok(PathBuf::from(path))
    }
}

#[async_trait]
impl BlobStore for LocalDirStore {
    async fn store(&self, data: &[u8]) -> Result<String> {
        let path = self.root.join(content_name(data));
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| DfmError::Cache(format!("cannot create blob dir: {e}")))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| DfmError::Cache(format!("cannot write blob: {e}")))?;
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.path_for(uri)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| DfmError::Cache(format!("cannot read blob '{uri}': {e}")))
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        let path = self.path_for(uri)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let path = self.path_for(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DfmError::Cache(format!("cannot delete blob '{uri}': {e}"))),
        }
    }
}

/// In-memory blob store (`mem://` URIs) for tests and single-node use.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(&self, data: &[u8]) -> Result<String> {
        let uri = format!("mem://{}", content_name(data));
        self.data.write().await.insert(uri.clone(), data.to_vec());
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        self.data
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| DfmError::Cache(format!("no blob at '{uri}'")))
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.data.read().await.contains_key(uri))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.data.write().await.remove(uri);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = InMemoryBlobStore::new();
        let uri = store.store(b"payload").await.unwrap();
        assert!(uri.starts_with("mem://"));
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.get(&uri).await.unwrap(), b"payload");
        store.delete(&uri).await.unwrap();
        assert!(!store.exists(&uri).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_dedupes_by_content() {
        let store = InMemoryBlobStore::new();
        let a = store.store(b"same").await.unwrap();
        let b = store.store(b"same").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_local_dir_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirStore::new(dir.path().to_path_buf());
        let uri = store.store(b"image bytes").await.unwrap();
        assert!(uri.starts_with("file://"));
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.get(&uri).await.unwrap(), b"image bytes");
        store.delete(&uri).await.unwrap();
        assert!(!store.exists(&uri).await.unwrap());
        // Deleting again is fine.
        store.delete(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_blob_errors() {
        let store = InMemoryBlobStore::new();
        assert!(store.get("mem://nope").await.is_err());
    }

    #[test]
    fn test_blob_store_for_conf() {
        use dfm::config::{BlobProtocol, FsspecConf};

        assert!(blob_store_for(None).is_ok());
        assert!(blob_store_for(Some(&FsspecConf {
            protocol: BlobProtocol::Memory,
            base_path: None,
        }))
        .is_ok());
        // file protocol without base_path is a config error
        assert!(blob_store_for(Some(&FsspecConf {
            protocol: BlobProtocol::File,
            base_path: None,
        }))
        .is_err());
    }
}
