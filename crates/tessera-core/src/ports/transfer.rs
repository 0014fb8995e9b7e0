//! Transfer pipeline port
//!
//! Content leaving the device is compressed and encrypted; content arriving
//! is decrypted and inflated. The engine treats both directions as opaque
//! byte transformations keyed by a [`ContentKey`].

use thiserror::Error;

use crate::domain::newtypes::ContentKey;

/// Progress callback: `(bytes_done, bytes_total)`
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Errors raised while transforming content
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Port trait for the compress + encrypt pipeline
pub trait ITransferPipeline: Send + Sync {
    /// Fresh random per-file key
    fn generate_key(&self) -> ContentKey;

    /// Compress then encrypt `plain`
    ///
    /// `progress` is called once per processed chunk.
    fn encrypt(
        &self,
        plain: &[u8],
        key: &ContentKey,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<u8>, TransferError>;

    /// Decrypt then inflate `cipher`
    fn decrypt(
        &self,
        cipher: &[u8],
        key: &ContentKey,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<u8>, TransferError>;
}
