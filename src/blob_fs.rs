//! Filesystem [`BlobStore`] rooted at `[blobs].root`.
//!
//! Locators are already validated as relative paths without `..`
//! segments, so joining them onto the root cannot escape it.
//!
//! Writes land in a synced temp file beside the target first. `put`
//! publishes it with a hard link, which fails if the target exists;
//! `replace` publishes it with a rename. Either way the locator holds a
//! complete blob or none, and a crashed writer leaves only a stray
//! `.tmp` file behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use docflow_core::blob::BlobStore;
use docflow_core::models::BlobLocator;
use docflow_core::{PipelineError, Result};

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

    fn path_for(&self, locator: &BlobLocator) -> PathBuf {
        self.root.join(locator.as_str())
    }

    async fn write_temp(
        &self,
        locator: &BlobLocator,
        path: &Path,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(locator, e))?;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blob");
        let tmp = path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = written {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(io_error(locator, e));
        }
        Ok(tmp)
    }
}

fn io_error(locator: &BlobLocator, e: std::io::Error) -> PipelineError {
    PipelineError::TransientIo(format!("blob {}: {}", locator, e))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, locator: &BlobLocator, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(locator);
        let tmp = self.write_temp(locator, &path, bytes).await?;
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        tokio::fs::remove_file(&tmp).await.ok();
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = tokio::fs::read(&path)
                    .await
                    .map_err(|e| io_error(locator, e))?;
                if existing == bytes {
                    Ok(())
                } else {
                    Err(PipelineError::MalformedInput(format!(
                        "blob already exists with different content: {}",
                        locator
                    )))
                }
            }
            Err(e) => Err(io_error(locator, e)),
        }
    }

    async fn replace(&self, locator: &BlobLocator, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(locator);
        let tmp = self.write_temp(locator, &path, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(io_error(locator, e));
        }
        Ok(())
    }

    async fn get(&self, locator: &BlobLocator) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(locator)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(locator, e)),
        }
    }

    async fn delete(&self, locator: &BlobLocator) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(locator)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(locator, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_create_new_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let loc = BlobLocator::parse("tenants/t1/documents/d1/report.pdf").unwrap();

        store.put(&loc, b"%PDF-1.4").await.unwrap();
        assert!(dir.path().join("tenants/t1/documents/d1/report.pdf").exists());
        store.put(&loc, b"%PDF-1.4").await.unwrap();
        assert!(matches!(
            store.put(&loc, b"other").await.unwrap_err(),
            PipelineError::MalformedInput(_)
        ));
        assert_eq!(store.get(&loc).await.unwrap().unwrap(), b"%PDF-1.4");
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn writes_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let loc = BlobLocator::parse("tenants/t1/documents/d1/derived/form.json").unwrap();
        store.put(&loc, b"{}").await.unwrap();
        store.replace(&loc, b"{\"name\":\"Ion\"}").await.unwrap();

        let derived = dir.path().join("tenants/t1/documents/d1/derived");
        assert_eq!(file_names(&derived), vec!["form.json".to_string()]);
        assert_eq!(store.get(&loc).await.unwrap().unwrap(), b"{\"name\":\"Ion\"}");
    }

    #[tokio::test]
    async fn stray_partial_write_does_not_block_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let loc = BlobLocator::parse("tenants/t1/documents/d1/report.pdf").unwrap();
        // What a writer killed mid-write leaves behind.
        let docs = dir.path().join("tenants/t1/documents/d1");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join(".report.pdf.dead.tmp"), b"%PD").unwrap();

        store.put(&loc, b"%PDF-1.4").await.unwrap();
        store.put(&loc, b"%PDF-1.4").await.unwrap();
        assert_eq!(store.get(&loc).await.unwrap().unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn missing_blob_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let loc = BlobLocator::parse("tenants/t1/documents/gone/a.txt").unwrap();
        assert!(store.get(&loc).await.unwrap().is_none());
        assert!(!store.delete(&loc).await.unwrap());
        store.put(&loc, b"x").await.unwrap();
        assert!(store.delete(&loc).await.unwrap());
        assert!(store.get(&loc).await.unwrap().is_none());
    }
}
