//! Object store boundary.
//!
//! Uploaded blobs are immutable once written: [`BlobStore::put`] has
//! create-new semantics. Writing identical bytes to an existing locator
//! succeeds, writing different bytes fails.
//!
//! Derived artifacts are regenerated by workers whose output may differ
//! between runs, so they go through [`BlobStore::replace`] instead.
//! Implementations publish both writes atomically: a reader or a crashed
//! writer never leaves a partial blob at the locator.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::models::BlobLocator;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, locator: &BlobLocator, bytes: &[u8]) -> Result<()>;

    /// Write `bytes` at `locator`, replacing any existing blob.
    async fn replace(&self, locator: &BlobLocator, bytes: &[u8]) -> Result<()>;

    /// Returns `None` when the blob does not exist (e.g. deleted by the
    /// front door).
    async fn get(&self, locator: &BlobLocator) -> Result<Option<Vec<u8>>>;

    /// Returns whether a blob was removed.
    async fn delete(&self, locator: &BlobLocator) -> Result<bool>;
}

/// Hex SHA-256 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> PipelineError {
    PipelineError::TransientIo("blob store lock poisoned".to_string())
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, locator: &BlobLocator, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        match blobs.get(locator.as_str()) {
            Some(existing) if existing.as_slice() == bytes => Ok(()),
            Some(_) => Err(PipelineError::MalformedInput(format!(
                "blob already exists with different content: {}",
                locator
            ))),
            None => {
                blobs.insert(locator.as_str().to_string(), bytes.to_vec());
                Ok(())
            }
        }
    }

    async fn replace(&self, locator: &BlobLocator, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.insert(locator.as_str().to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, locator: &BlobLocator) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.get(locator.as_str()).cloned())
    }

    async fn delete(&self, locator: &BlobLocator) -> Result<bool> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        Ok(blobs.remove(locator.as_str()).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_create_new() {
        let store = InMemoryBlobStore::new();
        let loc = BlobLocator::parse("tenants/t/documents/d/a.txt").unwrap();
        store.put(&loc, b"hello").await.unwrap();
        store.put(&loc, b"hello").await.unwrap();
        assert!(store.put(&loc, b"changed").await.is_err());
        assert_eq!(store.get(&loc).await.unwrap().unwrap(), b"hello");
        assert!(store.delete(&loc).await.unwrap());
        assert!(store.get(&loc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_overwrites() {
        let store = InMemoryBlobStore::new();
        let loc = BlobLocator::parse("tenants/t/documents/d/derived/form.json").unwrap();
        store.replace(&loc, b"{\"a\":1}").await.unwrap();
        store.replace(&loc, b"{\"a\":2}").await.unwrap();
        assert_eq!(store.get(&loc).await.unwrap().unwrap(), b"{\"a\":2}");
    }
}
