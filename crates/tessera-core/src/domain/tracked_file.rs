//! Tracked files and their replicas
//!
//! A tracked file is one logical file of the sync mesh. It is observed as a
//! [`LocalFileRecord`] on this device and as a [`RemoteFileRecord`] on every
//! provider that stores it. Both share a [`FileMeta`] whose
//! [`VectorClock`] decides which replica wins.
//!
//! Records are never physically erased: deleting a file sets a tombstone
//! flag and bumps the clock so the deletion propagates like any other
//! modification.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{BlobId, ContentKey, DeviceId, FileId, ProviderId};
use super::vector_clock::{ClockOrdering, VectorClock};

// ============================================================================
// Relative path validation
// ============================================================================

/// Normalize a path relative to the sync root into `a/b/c` form
///
/// # Errors
/// Returns [`DomainError::InvalidPath`] for empty, absolute or escaping
/// paths.
pub fn normalize_relative_path(path: &Path) -> Result<String, DomainError> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(DomainError::InvalidPath(format!(
                    "path escapes the sync root: {}",
                    path.display()
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DomainError::InvalidPath(format!(
                    "path must be relative: {}",
                    path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(DomainError::InvalidPath("path is empty".to_string()));
    }
    Ok(parts.join("/"))
}

// ============================================================================
// FileMeta
// ============================================================================

/// Metadata shared by every replica of a tracked file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    id: FileId,
    clock: VectorClock,
    content_hash: Option<String>,
    last_modified: DateTime<Utc>,
    size: u64,
    deleted: bool,
    removed: bool,
    active: bool,
    relative_path: String,
}

impl FileMeta {
    /// Create the metadata of a file first added on `device`
    ///
    /// The clock starts at `{device: 1}`.
    ///
    /// # Errors
    /// Returns error if `relative_path` is not a valid relative path
    pub fn new(
        device: &DeviceId,
        relative_path: &Path,
        content_hash: impl Into<String>,
        size: u64,
        last_modified: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let mut clock = VectorClock::new();
        clock.increment(device);
        Ok(Self {
            id: FileId::new(),
            clock,
            content_hash: Some(content_hash.into()),
            last_modified,
            size,
            deleted: false,
            removed: false,
            active: true,
            relative_path: normalize_relative_path(relative_path)?,
        })
    }

    /// Rebuild metadata for a known identity and causal version
    ///
    /// Used by adapters importing records and by tests that need specific
    /// clocks.
    ///
    /// # Errors
    /// Returns error if `relative_path` is not a valid relative path
    pub fn with_identity(
        id: FileId,
        clock: VectorClock,
        relative_path: &Path,
        content_hash: Option<String>,
        size: u64,
        last_modified: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            id,
            clock,
            content_hash,
            last_modified,
            size,
            deleted: false,
            removed: false,
            active: true,
            relative_path: normalize_relative_path(relative_path)?,
        })
    }

    /// Immutable identity of the file
    pub fn id(&self) -> &FileId {
        &self.id
    }

    /// Causal version
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Hex SHA-256 of the plaintext content (None for tombstones)
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// Last modification time as observed by the writing device
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Plaintext size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Deleted by a user on some device
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Removed from the synchronized set without deleting local content
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Whether the file currently takes part in synchronization
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True for deleted or removed records
    pub fn is_tombstone(&self) -> bool {
        self.deleted || self.removed
    }

    /// Path relative to the sync root, `/`-separated
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Compare causal versions
    pub fn compare(&self, other: &FileMeta) -> ClockOrdering {
        self.clock.compare(&other.clock)
    }

    /// Record a content modification made on `device`
    pub fn record_modification(
        &mut self,
        device: &DeviceId,
        content_hash: impl Into<String>,
        size: u64,
        last_modified: DateTime<Utc>,
    ) {
        self.clock.increment(device);
        self.content_hash = Some(content_hash.into());
        self.size = size;
        self.last_modified = last_modified;
        self.deleted = false;
        self.removed = false;
        self.active = true;
    }

    /// Turn the record into a deletion tombstone authored by `device`
    pub fn record_deletion(&mut self, device: &DeviceId, at: DateTime<Utc>) {
        self.clock.increment(device);
        self.deleted = true;
        self.active = false;
        self.content_hash = None;
        self.size = 0;
        self.last_modified = at;
    }

    /// Turn the record into a removal tombstone authored by `device`
    pub fn record_removal(&mut self, device: &DeviceId, at: DateTime<Utc>) {
        self.clock.increment(device);
        self.removed = true;
        self.active = false;
        self.last_modified = at;
    }
}

// ============================================================================
// TrackedFile trait and the two replica kinds
// ============================================================================

/// Where a replica was observed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// The local filesystem replica
    Local,
    /// A remote provider's index
    Remote(ProviderId),
}

impl Origin {
    /// True for [`Origin::Local`]
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::Remote(id) => write!(f, "remote:{id}"),
        }
    }
}

/// Common view over local and remote replicas
pub trait TrackedFile {
    /// Shared metadata
    fn meta(&self) -> &FileMeta;

    /// Shortcut for `meta().id()`
    fn id(&self) -> &FileId {
        self.meta().id()
    }

    /// Shortcut for `meta().clock()`
    fn clock(&self) -> &VectorClock {
        self.meta().clock()
    }
}

/// Replica on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileRecord {
    meta: FileMeta,
}

impl LocalFileRecord {
    /// Wrap metadata
    pub fn new(meta: FileMeta) -> Self {
        Self { meta }
    }

    /// Mutable access for local change recording
    pub fn meta_mut(&mut self) -> &mut FileMeta {
        &mut self.meta
    }

    /// Unwrap into the shared metadata
    pub fn into_meta(self) -> FileMeta {
        self.meta
    }
}

impl TrackedFile for LocalFileRecord {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }
}

/// Replica stored on a remote provider
///
/// Besides the shared metadata it carries the per-file content key, the
/// backend-assigned blob holding the encrypted content and an `error` flag
/// marking a record whose last remote write failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileRecord {
    meta: FileMeta,
    content_key: Option<ContentKey>,
    blob: Option<BlobId>,
    #[serde(default)]
    error: bool,
}

impl RemoteFileRecord {
    /// Record for content uploaded to `blob` with `content_key`
    pub fn new(meta: FileMeta, content_key: ContentKey, blob: BlobId) -> Self {
        Self {
            meta,
            content_key: Some(content_key),
            blob: Some(blob),
            error: false,
        }
    }

    /// Record for a tombstone (no content stored remotely)
    pub fn tombstone(meta: FileMeta) -> Self {
        Self {
            meta,
            content_key: None,
            blob: None,
            error: false,
        }
    }

    /// Per-file symmetric key (None for tombstones)
    pub fn content_key(&self) -> Option<&ContentKey> {
        self.content_key.as_ref()
    }

    /// Blob holding the encrypted content (None for tombstones)
    pub fn blob(&self) -> Option<&BlobId> {
        self.blob.as_ref()
    }

    /// Whether the last remote write or read of this record failed
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Flag (or clear) the record for retry on the next round
    pub fn set_error(&mut self, error: bool) {
        self.error = error;
    }

    /// Same record with the error flag set
    #[must_use]
    pub fn with_error(mut self) -> Self {
        self.error = true;
        self
    }
}

impl TrackedFile for RemoteFileRecord {
    fn meta(&self) -> &FileMeta {
        &self.meta
    }
}
