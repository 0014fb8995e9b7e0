//! Shared test helpers for provider integration tests
//!
//! Provides wiremock-based mock server setup for the object store endpoints.

use tessera_core::domain::ProviderId;
use tessera_provider::HttpObjectStoreProvider;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path prefix of the bucket on the mock server
pub const BUCKET: &str = "/tessera";

/// Starts a mock server whose `HEAD /tessera` succeeds and returns an
/// adapter pointing at it.
pub async fn setup_store_mock() -> (MockServer, HttpObjectStoreProvider) {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path(BUCKET))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let provider = HttpObjectStoreProvider::new(
        ProviderId::new("bucket").unwrap(),
        format!("{}{}", server.uri(), BUCKET),
        Some("test-token".to_string()),
    );

    (server, provider)
}

/// Mounts `GET /tessera/{blob}` returning `content`.
pub async fn mount_blob(server: &MockServer, blob: &str, content: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("{BUCKET}/{blob}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content.to_vec())
                .append_header("Content-Type", "application/octet-stream"),
        )
        .mount(server)
        .await;
}

/// Mounts `method path` answering with a bare status code.
pub async fn mount_status(server: &MockServer, verb: &str, blob_path: &str, status: u16) {
    Mock::given(method(verb))
        .and(path(blob_path))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}
