//! Tessera Sync - the synchronization engine
//!
//! Provides:
//! - Remote leases guarding each provider's index
//! - The per-provider state machine and serialized write queue
//! - The local replica mirror
//! - The round orchestrator deciding, per file, which replica wins
//!
//! ## Modules
//!
//! - [`events`] - broadcast channels for the UI layer
//! - [`lease`] - remote lease acquisition, renewal and release
//! - [`lifecycle`] - provider slots and their status transitions
//! - [`local`] - in-memory mirror of local tracked files
//! - [`orchestrator`] - synchronization rounds
//! - [`write_queue`] - debounced per-provider job serialization

pub mod events;
pub mod lease;
pub mod lifecycle;
pub mod local;
pub mod orchestrator;
pub mod write_queue;

use tessera_core::domain::{DeviceId, DomainError, FileId};
use tessera_core::ports::{ProviderError, TransferError};
use tessera_index::IndexError;
use thiserror::Error;

pub use events::EventBus;
pub use lease::{LeaseManager, LeaseOutcome, LeaseStatus};
pub use lifecycle::{ActiveGuard, ProviderLifecycle, ProviderSlot, SlotSettings};
pub use local::{LocalReplica, ScanSummary};
pub use orchestrator::{SyncOrchestrator, SyncReport};
pub use write_queue::{IQueueEpilogue, SerializedWriteQueue};

/// Errors that can occur during synchronization
#[derive(Debug, Error)]
pub enum SyncError {
    /// A blob or local file is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another device holds the provider lease
    #[error("Lease held by {owner}")]
    LockUnavailable { owner: DeviceId },

    /// The lease was lost while work depended on it
    #[error("Lease expired")]
    LockExpired,

    /// The provider rejected our credentials
    #[error("Provider unauthorized: {0}")]
    ProviderUnauthorized(String),

    /// The provider is unreachable or failing
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Unclassified provider failure affecting a single operation
    #[error("Provider error: {0}")]
    Provider(String),

    /// Encryption, decryption or compression failed
    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Replicas of a file were modified independently
    #[error("Conflicting versions of file {0}")]
    Conflict(FileId),

    /// Remote state is corrupt; aborts the round
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// The job was still queued when its write queue stopped
    #[error("Write queue drained before the job ran")]
    Drained,

    /// The engine is shutting down
    #[error("Shutting down")]
    ShuttingDown,

    /// Local I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record, config or lease could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A domain-level error propagated from tessera-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl SyncError {
    /// Failures that disqualify the whole provider for the rest of the round
    pub fn is_provider_level(&self) -> bool {
        matches!(
            self,
            SyncError::ProviderUnauthorized(_)
                | SyncError::ProviderUnavailable(_)
                | SyncError::LockUnavailable { .. }
                | SyncError::LockExpired
                | SyncError::Drained
                | SyncError::ShuttingDown
        )
    }

    /// Failures that abort the whole round
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Invariant(_))
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(blob) => SyncError::NotFound(blob.to_string()),
            ProviderError::Unauthorized(msg) => SyncError::ProviderUnauthorized(msg),
            ProviderError::Unavailable(msg) => SyncError::ProviderUnavailable(msg),
            ProviderError::Io(e) => SyncError::Io(e),
            ProviderError::Other(e) => SyncError::Provider(format!("{e:#}")),
        }
    }
}

impl From<IndexError> for SyncError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Provider(e) => e.into(),
            IndexError::Transfer(e) => SyncError::Transfer(e),
            IndexError::Codec(e) => SyncError::Serialization(e),
            IndexError::Invariant(msg) => SyncError::Invariant(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_core::domain::BlobId;

    use super::*;

    #[test]
    fn test_provider_error_classification() {
        let err: SyncError = ProviderError::Unavailable("down".into()).into();
        assert!(err.is_provider_level());

        let err: SyncError = ProviderError::NotFound(BlobId::lease()).into();
        assert!(matches!(err, SyncError::NotFound(ref b) if b == "tessera.lease"));
        assert!(!err.is_provider_level());

        let err: SyncError = IndexError::Invariant("cycle".into()).into();
        assert!(err.is_fatal());
    }
}
