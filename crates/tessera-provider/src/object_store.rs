//! HTTP object store adapter
//!
//! Talks to a minimal REST object store:
//!
//! | Operation | Request                 | Success            |
//! |-----------|-------------------------|--------------------|
//! | init      | `HEAD {base}`           | 2xx                |
//! | get       | `GET {base}/{blob}`     | 200 + body         |
//! | put       | `PUT {base}/{blob}`     | 2xx                |
//! | post      | `POST {base}`           | 2xx + `{"id": ..}` |
//! | delete    | `DELETE {base}/{blob}`  | 2xx                |
//!
//! Status mapping: 401/403 → `Unauthorized`, 404 → `NotFound`, 5xx and
//! connection failures → `Unavailable`, anything else → `Other`.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tessera_core::domain::{BlobId, DeviceId, ProviderId, ProviderStatus};
use tessera_core::ports::{IStorageProvider, ProviderError, ProviderKind};
use tracing::{debug, instrument, warn};

/// Response body of `POST {base}`
#[derive(Debug, Deserialize)]
struct PostResponse {
    id: String,
}

/// Adapter for an HTTP object store
#[derive(Debug, Clone)]
pub struct HttpObjectStoreProvider {
    id: ProviderId,
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStoreProvider {
    /// Create an adapter for `base_url`, optionally sending a bearer token
    pub fn new(id: ProviderId, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            id,
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, blob: Option<&BlobId>) -> RequestBuilder {
        let url = match blob {
            Some(blob) => format!("{}/{}", self.base_url, blob.as_str()),
            None => self.base_url.clone(),
        };
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        blob: Option<&BlobId>,
    ) -> Result<Response, ProviderError> {
        let response = builder.send().await.map_err(|e| {
            warn!(provider = %self.id, error = %e, "object store request failed");
            ProviderError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(classify(status, blob))
    }
}

/// Map a non-success status to a [`ProviderError`]
fn classify(status: StatusCode, blob: Option<&BlobId>) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Unauthorized(format!("object store answered {status}"))
        }
        StatusCode::NOT_FOUND => match blob {
            Some(blob) => ProviderError::NotFound(blob.clone()),
            None => ProviderError::Unavailable("object store base URL not found".to_string()),
        },
        s if s.is_server_error() => {
            ProviderError::Unavailable(format!("object store answered {status}"))
        }
        _ => ProviderError::Other(anyhow::anyhow!("unexpected object store status {status}")),
    }
}

#[async_trait]
impl IStorageProvider for HttpObjectStoreProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ObjectStore
    }

    #[instrument(skip(self), fields(provider = %self.id, base = %self.base_url))]
    async fn init(&self, device: &DeviceId) -> Result<ProviderStatus, ProviderError> {
        match self.send(self.request(Method::HEAD, None), None).await {
            Ok(_) => Ok(ProviderStatus::Initialized),
            Err(ProviderError::Unauthorized(reason)) => {
                warn!(%reason, "object store rejected credentials");
                Ok(ProviderStatus::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, blob: &BlobId) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .send(self.request(Method::GET, Some(blob)), Some(blob))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        debug!(blob = %blob, bytes = bytes.len(), "downloaded blob");
        Ok(bytes.to_vec())
    }

    async fn put(&self, blob: &BlobId, data: Vec<u8>) -> Result<(), ProviderError> {
        debug!(blob = %blob, bytes = data.len(), "uploading blob");
        self.send(self.request(Method::PUT, Some(blob)).body(data), Some(blob))
            .await?;
        Ok(())
    }

    async fn post(&self, data: Vec<u8>) -> Result<BlobId, ProviderError> {
        let response = self
            .send(self.request(Method::POST, None).body(data), None)
            .await?;
        let body: PostResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Other(anyhow::anyhow!("invalid POST response: {e}")))?;
        let blob = BlobId::new(body.id).map_err(anyhow::Error::from)?;
        debug!(blob = %blob, "object store assigned blob");
        Ok(blob)
    }

    async fn delete(&self, blob: &BlobId) -> Result<(), ProviderError> {
        self.send(self.request(Method::DELETE, Some(blob)), Some(blob))
            .await?;
        Ok(())
    }
}
