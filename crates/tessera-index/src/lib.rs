//! Tessera Index - the chunked remote file index (FDX)
//!
//! Every provider stores the list of [`RemoteFileRecord`]s it holds as a
//! singly linked chain of encrypted pages of at most K records each. The
//! descriptor of the head page lives in the provider config; every page
//! carries the descriptor of its successor.
//!
//! The in-memory side is an arena of [`page::IndexPage`] slots linked by
//! [`PageIdx`] with explicit per-page [`PageStatus`] dirty marking, so
//! [`ChunkedRemoteIndex::save`] touches exactly the pages that changed.
//!
//! [`RemoteFileRecord`]: tessera_core::domain::RemoteFileRecord

pub mod index;
pub mod page;

use tessera_core::ports::{ProviderError, TransferError};
use thiserror::Error;

pub use index::{ChunkedRemoteIndex, RemoteFileAction, SaveReport};
pub use page::{IndexChange, PageIdx, PageStatus};

/// Errors raised while loading, reconciling or saving the index
#[derive(Debug, Error)]
pub enum IndexError {
    /// The provider failed a page operation
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A page could not be sealed or opened
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A page body is not a valid page
    #[error("page codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The chain is corrupt (cycle, orphaned page, stale link); fatal for the round
    #[error("index invariant violated: {0}")]
    Invariant(String),
}

impl IndexError {
    /// True for provider-level failures (unauthorized, unavailable)
    pub fn is_provider_level(&self) -> bool {
        matches!(self, IndexError::Provider(e) if e.is_provider_level())
    }
}
