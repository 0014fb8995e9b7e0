//! Local folder adapter (secondary/driven adapter)
//!
//! Implements [`IStorageProvider`] on top of a plain directory, which is
//! how NAS mounts, USB drives and folders synchronized by third-party
//! clients are attached. Every blob is one file directly under the root.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: write-to-temp + rename, so a concurrent reader on
//!   another device never observes a half-written page or lease.
//! - **Flat layout**: [`BlobId`] validation already rejects separators and
//!   leading dots, so blob names map to file names one to one.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tessera_core::domain::{BlobId, DeviceId, ProviderId, ProviderStatus};
use tessera_core::ports::{IStorageProvider, ProviderError, ProviderKind};
use tracing::{debug, instrument};

/// Adapter storing blobs as files under `root`
#[derive(Debug, Clone)]
pub struct LocalFolderProvider {
    id: ProviderId,
    root: PathBuf,
}

impl LocalFolderProvider {
    /// Create an adapter for `root`; nothing is touched until [`init`](IStorageProvider::init)
    #[must_use]
    pub fn new(id: ProviderId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn blob_path(&self, blob: &BlobId) -> PathBuf {
        self.root.join(blob.as_str())
    }

    fn map_io(blob: &BlobId, err: std::io::Error) -> ProviderError {
        match err.kind() {
            ErrorKind::NotFound => ProviderError::NotFound(blob.clone()),
            ErrorKind::PermissionDenied => ProviderError::Unauthorized(err.to_string()),
            _ => ProviderError::Io(err),
        }
    }
}

#[async_trait]
impl IStorageProvider for LocalFolderProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalFolder
    }

    #[instrument(skip(self), fields(provider = %self.id, root = %self.root.display()))]
    async fn init(&self, device: &DeviceId) -> Result<ProviderStatus, ProviderError> {
        match tokio::fs::create_dir_all(&self.root).await {
            Ok(()) => Ok(ProviderStatus::Initialized),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(ProviderStatus::Unauthorized),
            Err(e) => Err(ProviderError::Unavailable(format!(
                "cannot open {}: {e}",
                self.root.display()
            ))),
        }
    }

    async fn get(&self, blob: &BlobId) -> Result<Vec<u8>, ProviderError> {
        tokio::fs::read(self.blob_path(blob))
            .await
            .map_err(|e| Self::map_io(blob, e))
    }

    async fn put(&self, blob: &BlobId, data: Vec<u8>) -> Result<(), ProviderError> {
        let target = self.blob_path(blob);
        let tmp_path = self.root.join(format!(".{}.tmp", blob.as_str()));

        debug!(blob = %blob, bytes = data.len(), "writing blob");
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| Self::map_io(blob, e))?;
        tokio::fs::rename(&tmp_path, &target)
            .await
            .map_err(|e| Self::map_io(blob, e))
    }

    async fn post(&self, data: Vec<u8>) -> Result<BlobId, ProviderError> {
        let blob = BlobId::generate();
        self.put(&blob, data).await?;
        Ok(blob)
    }

    async fn delete(&self, blob: &BlobId) -> Result<(), ProviderError> {
        debug!(blob = %blob, "deleting blob");
        tokio::fs::remove_file(self.blob_path(blob))
            .await
            .map_err(|e| Self::map_io(blob, e))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn provider(dir: &TempDir) -> LocalFolderProvider {
        LocalFolderProvider::new(
            ProviderId::new("folder").unwrap(),
            dir.path().join("store"),
        )
    }

    #[tokio::test]
    async fn test_init_creates_root() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        let status = p.init(&DeviceId::new("dev1").unwrap()).await.unwrap();
        assert_eq!(status, ProviderStatus::Initialized);
        assert!(p.root().is_dir());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.init(&DeviceId::new("dev1").unwrap()).await.unwrap();

        let blob = BlobId::config();
        p.put(&blob, b"v1".to_vec()).await.unwrap();
        p.put(&blob, b"v2".to_vec()).await.unwrap();
        assert_eq!(p.get(&blob).await.unwrap(), b"v2");

        p.delete(&blob).await.unwrap();
        assert!(p.get(&blob).await.unwrap_err().is_not_found());
        assert!(p.delete(&blob).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_post_assigns_fresh_names() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.init(&DeviceId::new("dev1").unwrap()).await.unwrap();

        let a = p.post(b"a".to_vec()).await.unwrap();
        let b = p.post(b"b".to_vec()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(p.get(&a).await.unwrap(), b"a");

        // No temp files left behind
        let mut entries = tokio::fs::read_dir(p.root()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }
}
