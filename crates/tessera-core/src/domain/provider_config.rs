//! Durable per-provider configuration
//!
//! One [`ProviderConfig`] is stored (encrypted with the shared secret) on
//! every provider under the well-known blob
//! [`BlobId::CONFIG`](super::BlobId::CONFIG). It holds the registered
//! credentials and the descriptor of the first page of the remote index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{BlobId, ProviderId};

/// Durable per-provider record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    provider: ProviderId,
    /// Opaque registered credentials, interpreted by the adapter
    #[serde(default)]
    credentials: serde_json::Value,
    /// Head descriptor of the remote index page chain
    head: Option<BlobId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    /// Empty config: no credentials registered, no index pages yet
    pub fn empty(provider: ProviderId) -> Self {
        let now = Utc::now();
        Self {
            provider,
            credentials: serde_json::Value::Null,
            head: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn credentials(&self) -> &serde_json::Value {
        &self.credentials
    }

    pub fn head(&self) -> Option<&BlobId> {
        self.head.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Point the config at a new index head
    pub fn set_head(&mut self, head: Option<BlobId>) {
        self.head = head;
        self.updated_at = Utc::now();
    }

    /// Register adapter credentials
    pub fn set_credentials(&mut self, credentials: serde_json::Value) {
        self.credentials = credentials;
        self.updated_at = Utc::now();
    }
}
