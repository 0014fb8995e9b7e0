//! Events emitted by the engine
//!
//! Three event kinds are published for the UI layer: provider status
//! changes, file events and byte-level transfer progress. The channels
//! carrying them are owned by the engine; these are only the payloads.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use super::newtypes::{FileId, ProviderId};

/// Connection / activation state of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Not connected yet
    Uninitialized,
    /// Credentials rejected; needs external re-authorization
    Unauthorized,
    /// Lease lost or expired; re-acquisition is retried automatically
    Expired,
    /// Connected, no config loaded yet
    Initialized,
    /// Config and index loaded; part of the enabled set
    Active,
    /// Unexpected failure; excluded for the rest of the session
    Error,
}

impl ProviderStatus {
    /// Lowercase name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            ProviderStatus::Uninitialized => "uninitialized",
            ProviderStatus::Unauthorized => "unauthorized",
            ProviderStatus::Expired => "expired",
            ProviderStatus::Initialized => "initialized",
            ProviderStatus::Active => "active",
            ProviderStatus::Error => "error",
        }
    }

    /// States from which `init` may be (re)attempted
    pub fn can_initialize(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Uninitialized | ProviderStatus::Unauthorized | ProviderStatus::Expired
        )
    }
}

impl Display for ProviderStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A provider changed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub provider: ProviderId,
    pub status: ProviderStatus,
}

/// What happened to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventType {
    Created,
    Updated,
    Deleted,
    Removed,
    /// Replica now matches the winning version
    Synched,
    /// Replica is behind the winning version
    Unsynched,
    /// Replicas were modified independently; left untouched
    Conflicted,
    Error,
}

/// Which replica an event refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLocation {
    Local,
    Remote(ProviderId),
}

/// A file event for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub file: FileId,
    pub path: String,
    pub kind: FileEventType,
    pub location: FileLocation,
}

/// Transfer direction of a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Byte-count progress of a single file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub file: FileId,
    pub provider: ProviderId,
    pub direction: TransferDirection,
    pub bytes_done: u64,
    pub bytes_total: u64,
}
