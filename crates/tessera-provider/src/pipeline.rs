//! Compression + authenticated encryption pipeline
//!
//! Implements [`ITransferPipeline`]: content is deflated, then sealed with
//! AES-256-GCM under a per-file (or metadata) key.
//!
//! Sealed format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use std::io::{Read, Write};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rand::RngCore;
use tessera_core::domain::{ContentKey, KEY_LEN};
use tessera_core::ports::{ITransferPipeline, ProgressFn, TransferError};

/// Size of the GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Granularity of progress reporting
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Deflate + AES-256-GCM pipeline
#[derive(Debug, Clone)]
pub struct AeadTransferPipeline {
    level: Compression,
}

impl AeadTransferPipeline {
    /// Pipeline with the default compression level
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Pipeline with an explicit compression level (0-9)
    #[must_use]
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    fn cipher(key: &ContentKey) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()))
    }
}

impl Default for AeadTransferPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ITransferPipeline for AeadTransferPipeline {
    fn generate_key(&self) -> ContentKey {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        ContentKey::from_bytes(bytes)
    }

    fn encrypt(
        &self,
        plain: &[u8],
        key: &ContentKey,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<u8>, TransferError> {
        let total = plain.len() as u64;
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(plain.len() / 2), self.level);
        let mut done = 0u64;
        for chunk in plain.chunks(CHUNK_SIZE) {
            encoder.write_all(chunk)?;
            done += chunk.len() as u64;
            if let Some(report) = progress {
                report(done, total);
            }
        }
        if plain.is_empty() {
            if let Some(report) = progress {
                report(0, 0);
            }
        }
        let compressed = encoder.finish()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = Self::cipher(key)
            .encrypt(nonce, compressed.as_slice())
            .map_err(|_| TransferError::Encrypt("AES-GCM seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(
        &self,
        cipher: &[u8],
        key: &ContentKey,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<u8>, TransferError> {
        if cipher.len() < NONCE_SIZE + TAG_SIZE {
            return Err(TransferError::Decrypt(format!(
                "sealed data too short: {} bytes",
                cipher.len()
            )));
        }
        let (nonce_bytes, sealed) = cipher.split_at(NONCE_SIZE);
        let compressed = Self::cipher(key)
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| TransferError::Decrypt("authentication failed".to_string()))?;

        let total = compressed.len() as u64;
        let mut decoder = DeflateDecoder::new(compressed.as_slice());
        let mut plain = Vec::with_capacity(compressed.len() * 2);
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            plain.extend_from_slice(&buf[..n]);
            if let Some(report) = progress {
                report(decoder.total_in(), total);
            }
        }
        if let Some(report) = progress {
            report(total, total);
        }
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_encrypt_decrypt_restores_content() {
        let pipeline = AeadTransferPipeline::new();
        let key = pipeline.generate_key();
        let plain = b"hello tessera, hello tessera, hello tessera".repeat(100);

        let sealed = pipeline.encrypt(&plain, &key, None).unwrap();
        assert!(sealed.len() < plain.len(), "repetitive input should compress");
        assert_eq!(pipeline.decrypt(&sealed, &key, None).unwrap(), plain);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let pipeline = AeadTransferPipeline::new();
        let sealed = pipeline
            .encrypt(b"secret", &pipeline.generate_key(), None)
            .unwrap();
        let err = pipeline
            .decrypt(&sealed, &pipeline.generate_key(), None)
            .unwrap_err();
        assert!(matches!(err, TransferError::Decrypt(_)));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let pipeline = AeadTransferPipeline::new();
        let key = pipeline.generate_key();
        assert!(pipeline.decrypt(&[0u8; 10], &key, None).is_err());
    }

    #[test]
    fn test_nonce_is_random() {
        let pipeline = AeadTransferPipeline::new();
        let key = pipeline.generate_key();
        let a = pipeline.encrypt(b"same", &key, None).unwrap();
        let b = pipeline.encrypt(b"same", &key, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_progress_reported_per_chunk() {
        let pipeline = AeadTransferPipeline::with_level(1);
        let key = pipeline.generate_key();
        let plain: Vec<u8> = (0..(CHUNK_SIZE * 3 + 10)).map(|i| (i % 251) as u8).collect();

        let calls = Mutex::new(Vec::new());
        let report = |done: u64, total: u64| calls.lock().unwrap().push((done, total));
        let sealed = pipeline.encrypt(&plain, &key, Some(&report)).unwrap();

        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last(), Some(&(plain.len() as u64, plain.len() as u64)));
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));

        let last = AtomicU64::new(0);
        let report = |done: u64, total: u64| {
            assert!(done <= total);
            last.store(done, Ordering::SeqCst);
        };
        let restored = pipeline.decrypt(&sealed, &key, Some(&report)).unwrap();
        assert_eq!(restored, plain);
        assert!(last.load(Ordering::SeqCst) > 0);
    }
}
