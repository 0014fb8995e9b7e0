//! Tessera Provider - storage backends and the transfer pipeline
//!
//! Implements the ports declared in `tessera-core`:
//! - [`IStorageProvider`] adapters for a local (or mounted) folder, an HTTP
//!   object store and an in-memory store used by tests
//! - [`ITransferPipeline`](tessera_core::ports::ITransferPipeline) as
//!   deflate + AES-256-GCM
//!
//! ## Modules
//!
//! - [`local_folder`] - blobs as files under a root directory
//! - [`object_store`] - blobs behind a REST object store
//! - [`memory`] - in-process store with I/O counters and failure injection
//! - [`pipeline`] - compression and authenticated encryption

pub mod local_folder;
pub mod memory;
pub mod object_store;
pub mod pipeline;

use std::sync::Arc;

use tessera_core::config::ProviderSettings;
use tessera_core::domain::ProviderId;
use tessera_core::ports::{IStorageProvider, ProviderError, ProviderKind};

pub use local_folder::LocalFolderProvider;
pub use memory::MemoryProvider;
pub use object_store::HttpObjectStoreProvider;
pub use pipeline::AeadTransferPipeline;

/// Builds the adapter described by one `providers` entry of the configuration
///
/// # Errors
/// Returns [`ProviderError::Other`] for invalid ids, missing settings, or
/// kinds whose binding is not part of this crate.
pub fn build_provider(
    settings: &ProviderSettings,
) -> Result<Arc<dyn IStorageProvider>, ProviderError> {
    let id = ProviderId::new(settings.id.as_str()).map_err(anyhow::Error::from)?;

    match settings.kind {
        ProviderKind::LocalFolder => {
            let path = settings.path.clone().ok_or_else(|| {
                anyhow::anyhow!("provider '{}' has no path configured", settings.id)
            })?;
            Ok(Arc::new(LocalFolderProvider::new(id, path)))
        }
        ProviderKind::ObjectStore => {
            let base_url = settings.base_url.clone().ok_or_else(|| {
                anyhow::anyhow!("provider '{}' has no base_url configured", settings.id)
            })?;
            Ok(Arc::new(HttpObjectStoreProvider::new(
                id,
                base_url,
                settings.token.clone(),
            )))
        }
        ProviderKind::OauthDrive => Err(ProviderError::Other(anyhow::anyhow!(
            "provider '{}': oauth_drive requires an external drive binding",
            settings.id
        ))),
    }
}
