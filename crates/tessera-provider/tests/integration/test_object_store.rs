//! Integration tests for the HTTP object store adapter
//!
//! Verifies request shapes and status mapping against a wiremock server.

use tessera_core::domain::{BlobId, DeviceId, ProviderId, ProviderStatus};
use tessera_core::ports::{IStorageProvider, ProviderError};
use tessera_provider::HttpObjectStoreProvider;
use wiremock::matchers::{body_bytes, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{self, BUCKET};

fn device() -> DeviceId {
    DeviceId::new("dev1").unwrap()
}

// ============================================================================
// init
// ============================================================================

#[tokio::test]
async fn test_init_probes_base_url() {
    let (_server, provider) = common::setup_store_mock().await;
    let status = provider.init(&device()).await.unwrap();
    assert_eq!(status, ProviderStatus::Initialized);
}

#[tokio::test]
async fn test_init_reports_unauthorized() {
    let server = MockServer::start().await;
    common::mount_status(&server, "HEAD", BUCKET, 401).await;

    let provider = HttpObjectStoreProvider::new(
        ProviderId::new("bucket").unwrap(),
        format!("{}{}", server.uri(), BUCKET),
        Some("expired".to_string()),
    );
    assert_eq!(
        provider.init(&device()).await.unwrap(),
        ProviderStatus::Unauthorized
    );
}

#[tokio::test]
async fn test_init_unreachable_is_unavailable() {
    // Port 9 (discard) on localhost is not expected to accept HTTP
    let provider = HttpObjectStoreProvider::new(
        ProviderId::new("bucket").unwrap(),
        "http://127.0.0.1:9/tessera",
        None,
    );
    let err = provider.init(&device()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable(_)));
}

// ============================================================================
// Blob operations
// ============================================================================

#[tokio::test]
async fn test_get_returns_content() {
    let (server, provider) = common::setup_store_mock().await;
    common::mount_blob(&server, "tessera.config", b"sealed-config").await;

    let data = provider.get(&BlobId::config()).await.unwrap();
    assert_eq!(data, b"sealed-config");
}

#[tokio::test]
async fn test_get_missing_blob_is_not_found() {
    let (server, provider) = common::setup_store_mock().await;
    common::mount_status(&server, "GET", "/tessera/tessera.lease", 404).await;

    let err = provider.get(&BlobId::lease()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_put_sends_body_and_token() {
    let (server, provider) = common::setup_store_mock().await;

    Mock::given(method("PUT"))
        .and(path("/tessera/page-1"))
        .and(header("Authorization", "Bearer test-token"))
        .and(body_bytes(b"page-bytes".to_vec()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    provider
        .put(&BlobId::new("page-1").unwrap(), b"page-bytes".to_vec())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_post_returns_assigned_id() {
    let (server, provider) = common::setup_store_mock().await;

    Mock::given(method("POST"))
        .and(path(BUCKET))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "abc123" })),
        )
        .mount(&server)
        .await;

    let blob = provider.post(b"content".to_vec()).await.unwrap();
    assert_eq!(blob.as_str(), "abc123");
}

#[tokio::test]
async fn test_delete_status_mapping() {
    let (server, provider) = common::setup_store_mock().await;
    common::mount_status(&server, "DELETE", "/tessera/gone", 404).await;
    common::mount_status(&server, "DELETE", "/tessera/locked", 403).await;
    common::mount_status(&server, "DELETE", "/tessera/busy", 503).await;

    let err = provider
        .delete(&BlobId::new("gone").unwrap())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = provider
        .delete(&BlobId::new("locked").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unauthorized(_)));

    let err = provider
        .delete(&BlobId::new("busy").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable(_)));
}
