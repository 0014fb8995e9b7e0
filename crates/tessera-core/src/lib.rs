//! Tessera Core - Domain logic and ports
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `VectorClock`, `FileMeta`, `LocalFileRecord`,
//!   `RemoteFileRecord`, `ProviderConfig`, `LeaseRecord`
//! - **Port definitions** - `IStorageProvider`, `ITransferPipeline`
//! - **Configuration** - YAML configuration with validation
//!
//! # Architecture
//!
//! The domain module contains pure data types with no I/O. Ports define
//! trait interfaces that adapter crates implement. The sync engine only
//! talks to backends through these ports.

pub mod config;
pub mod domain;
pub mod ports;
