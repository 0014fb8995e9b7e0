//! Storage provider port (driven/secondary port)
//!
//! Every backend (local folder, object store, OAuth drive) is reduced to the
//! same five operations on opaque blobs. The engine never sees paths,
//! buckets or drive items; it only stores and fetches bytes under
//! [`BlobId`]s.
//!
//! ## Design Notes
//!
//! - `NotFound` is a distinguished error because it is frequently expected
//!   (first-time config creation, lease absent, deleting an already deleted
//!   page) and must not be confused with a provider outage.
//! - Authorization and availability failures are provider-level: the
//!   lifecycle removes the provider from the enabled set when it sees them.

use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::events::ProviderStatus;
use crate::domain::newtypes::{BlobId, DeviceId, ProviderId};

/// Backend family of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    LocalFolder,
    ObjectStore,
    OauthDrive,
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::LocalFolder => "local_folder",
            ProviderKind::ObjectStore => "object_store",
            ProviderKind::OauthDrive => "oauth_drive",
        };
        f.write_str(s)
    }
}

/// Errors returned by provider adapters
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The blob does not exist
    #[error("blob not found: {0}")]
    NotFound(BlobId),

    /// Credentials were rejected
    #[error("provider unauthorized: {0}")]
    Unauthorized(String),

    /// Backend unreachable or failing (network, 5xx, missing mount)
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Local I/O failure inside the adapter
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else the adapter could not classify
    #[error("provider error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// True for [`ProviderError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    /// True for failures that disqualify the whole provider
    pub fn is_provider_level(&self) -> bool {
        matches!(
            self,
            ProviderError::Unauthorized(_) | ProviderError::Unavailable(_)
        )
    }
}

/// Port trait for a remote storage backend
///
/// Implementations must be cheap to share (`Arc<dyn IStorageProvider>`);
/// the engine calls them concurrently from different tasks.
#[async_trait]
pub trait IStorageProvider: Send + Sync {
    /// Configured identifier of this provider
    fn provider_id(&self) -> &ProviderId;

    /// Backend family
    fn kind(&self) -> ProviderKind;

    /// Connects to the backend on behalf of `device`
    ///
    /// # Returns
    /// [`ProviderStatus::Initialized`] on success, or
    /// [`ProviderStatus::Unauthorized`] when credentials are rejected.
    async fn init(&self, device: &DeviceId) -> Result<ProviderStatus, ProviderError>;

    /// Fetches a blob's bytes
    async fn get(&self, blob: &BlobId) -> Result<Vec<u8>, ProviderError>;

    /// Creates or overwrites a blob under a caller-chosen name
    async fn put(&self, blob: &BlobId, data: Vec<u8>) -> Result<(), ProviderError>;

    /// Stores a new blob and returns the backend-assigned name
    async fn post(&self, data: Vec<u8>) -> Result<BlobId, ProviderError>;

    /// Deletes a blob
    async fn delete(&self, blob: &BlobId) -> Result<(), ProviderError>;
}
