//! In-memory storage provider
//!
//! A [`DashMap`]-backed store that behaves like a remote backend without
//! leaving the process. Tests use it to count the I/O a component performs
//! and to inject provider failures; several engines sharing one
//! `Arc<MemoryProvider>` simulate devices sharing a remote.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tessera_core::domain::{BlobId, DeviceId, ProviderId, ProviderStatus};
use tessera_core::ports::{IStorageProvider, ProviderError, ProviderKind};

/// Provider operation, used to target counters and injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Get,
    Put,
    Post,
    Delete,
}

/// Failure returned by an operation while injected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Credentials rejected (`init` reports [`ProviderStatus::Unauthorized`])
    Unauthorized,
    /// Backend unreachable
    Unavailable,
    /// Unclassified adapter error (file-level)
    Other,
}

/// Snapshot of the I/O performed so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounts {
    pub gets: u64,
    pub puts: u64,
    pub posts: u64,
    pub deletes: u64,
}

impl IoCounts {
    /// Writes of any kind (`put`, `post`, `delete`)
    pub fn writes(&self) -> u64 {
        self.puts + self.posts + self.deletes
    }

    /// All counted operations
    pub fn total(&self) -> u64 {
        self.gets + self.writes()
    }
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    posts: AtomicU64,
    deletes: AtomicU64,
}

/// In-process [`IStorageProvider`]
#[derive(Debug)]
pub struct MemoryProvider {
    id: ProviderId,
    blobs: DashMap<BlobId, Vec<u8>>,
    counters: Counters,
    failures: Mutex<HashMap<Operation, Failure>>,
}

impl MemoryProvider {
    /// Create an empty store
    #[must_use]
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            blobs: DashMap::new(),
            counters: Counters::default(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// I/O performed since creation or the last [`reset_counts`](Self::reset_counts)
    pub fn io_counts(&self) -> IoCounts {
        IoCounts {
            gets: self.counters.gets.load(Ordering::SeqCst),
            puts: self.counters.puts.load(Ordering::SeqCst),
            posts: self.counters.posts.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    /// Zero every counter
    pub fn reset_counts(&self) {
        self.counters.gets.store(0, Ordering::SeqCst);
        self.counters.puts.store(0, Ordering::SeqCst);
        self.counters.posts.store(0, Ordering::SeqCst);
        self.counters.deletes.store(0, Ordering::SeqCst);
    }

    /// Make every call to `op` fail with `failure` until cleared
    pub fn inject_failure(&self, op: Operation, failure: Failure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, failure);
        }
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Whether `blob` exists
    pub fn contains(&self, blob: &BlobId) -> bool {
        self.blobs.contains_key(blob)
    }

    /// Stored bytes of `blob`, bypassing counters and failures
    pub fn raw(&self, blob: &BlobId) -> Option<Vec<u8>> {
        self.blobs.get(blob).map(|entry| entry.value().clone())
    }

    /// Store bytes directly, bypassing counters and failures
    pub fn insert_raw(&self, blob: BlobId, data: Vec<u8>) {
        self.blobs.insert(blob, data);
    }

    fn check(&self, op: Operation) -> Result<(), ProviderError> {
        let failure = self
            .failures
            .lock()
            .ok()
            .and_then(|failures| failures.get(&op).copied());

        match failure {
            None => Ok(()),
            Some(Failure::Unauthorized) => Err(ProviderError::Unauthorized(format!(
                "{}: injected {op:?} failure",
                self.id
            ))),
            Some(Failure::Unavailable) => Err(ProviderError::Unavailable(format!(
                "{}: injected {op:?} failure",
                self.id
            ))),
            Some(Failure::Other) => Err(ProviderError::Other(anyhow::anyhow!(
                "{}: injected {op:?} failure",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl IStorageProvider for MemoryProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ObjectStore
    }

    async fn init(&self, _device: &DeviceId) -> Result<ProviderStatus, ProviderError> {
        match self.check(Operation::Init) {
            Ok(()) => Ok(ProviderStatus::Initialized),
            Err(ProviderError::Unauthorized(_)) => Ok(ProviderStatus::Unauthorized),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, blob: &BlobId) -> Result<Vec<u8>, ProviderError> {
        self.check(Operation::Get)?;
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.raw(blob)
            .ok_or_else(|| ProviderError::NotFound(blob.clone()))
    }

    async fn put(&self, blob: &BlobId, data: Vec<u8>) -> Result<(), ProviderError> {
        self.check(Operation::Put)?;
        self.counters.puts.fetch_add(1, Ordering::SeqCst);
        self.blobs.insert(blob.clone(), data);
        Ok(())
    }

    async fn post(&self, data: Vec<u8>) -> Result<BlobId, ProviderError> {
        self.check(Operation::Post)?;
        self.counters.posts.fetch_add(1, Ordering::SeqCst);
        let blob = BlobId::generate();
        self.blobs.insert(blob.clone(), data);
        Ok(blob)
    }

    async fn delete(&self, blob: &BlobId) -> Result<(), ProviderError> {
        self.check(Operation::Delete)?;
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .remove(blob)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(blob.clone()))
    }
}
