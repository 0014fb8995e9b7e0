//! Domain entities and business logic
//!
//! This module contains the core domain types for Tessera:
//! - Newtypes for identifiers and key material
//! - Vector clocks for causal versioning
//! - Tracked file records (local and remote replicas)
//! - Provider config and lease records persisted on every backend
//! - Event payloads published to the UI layer
//! - Domain-specific error types

pub mod errors;
pub mod events;
pub mod lease;
pub mod newtypes;
pub mod provider_config;
pub mod tracked_file;
pub mod vector_clock;

// Re-export commonly used types
pub use errors::DomainError;
pub use events::{
    FileEvent, FileEventType, FileLocation, ProgressEvent, ProviderEvent, ProviderStatus,
    TransferDirection,
};
pub use lease::LeaseRecord;
pub use newtypes::*;
pub use provider_config::ProviderConfig;
pub use tracked_file::{
    normalize_relative_path, FileMeta, LocalFileRecord, Origin, RemoteFileRecord, TrackedFile,
};
pub use vector_clock::{ClockOrdering, VectorClock};
