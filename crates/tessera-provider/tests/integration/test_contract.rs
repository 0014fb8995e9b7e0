//! Provider contract shared by every adapter
//!
//! The engine relies on the same observable behavior from every backend:
//! `put` overwrites, `post` assigns fresh names, and missing blobs report
//! `NotFound` for both `get` and `delete`.

use std::sync::Arc;

use tempfile::TempDir;
use tessera_core::domain::{BlobId, DeviceId, ProviderId, ProviderStatus};
use tessera_core::ports::IStorageProvider;
use tessera_provider::{LocalFolderProvider, MemoryProvider};

async fn check_contract(provider: Arc<dyn IStorageProvider>) {
    let status = provider
        .init(&DeviceId::new("dev1").unwrap())
        .await
        .unwrap();
    assert_eq!(status, ProviderStatus::Initialized);

    let lease = BlobId::lease();
    assert!(provider.get(&lease).await.unwrap_err().is_not_found());

    provider.put(&lease, b"one".to_vec()).await.unwrap();
    provider.put(&lease, b"two".to_vec()).await.unwrap();
    assert_eq!(provider.get(&lease).await.unwrap(), b"two");

    let first = provider.post(b"page".to_vec()).await.unwrap();
    let second = provider.post(b"page".to_vec()).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(provider.get(&first).await.unwrap(), b"page");

    provider.delete(&first).await.unwrap();
    assert!(provider.get(&first).await.unwrap_err().is_not_found());
    assert!(provider.delete(&first).await.unwrap_err().is_not_found());
    assert_eq!(provider.get(&second).await.unwrap(), b"page");
}

#[tokio::test]
async fn test_memory_provider_contract() {
    check_contract(Arc::new(MemoryProvider::new(ProviderId::new("mem").unwrap()))).await;
}

#[tokio::test]
async fn test_local_folder_contract() {
    let dir = TempDir::new().unwrap();
    check_contract(Arc::new(LocalFolderProvider::new(
        ProviderId::new("folder").unwrap(),
        dir.path().join("remote"),
    )))
    .await;
}
