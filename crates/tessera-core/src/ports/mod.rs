//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the engine depends on but whose
//! implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IStorageProvider`] - Blob storage on a remote backend
//! - [`ITransferPipeline`] - Compression and encryption of content

pub mod provider;
pub mod transfer;

pub use provider::{IStorageProvider, ProviderError, ProviderKind};
pub use transfer::{ITransferPipeline, ProgressFn, TransferError};
