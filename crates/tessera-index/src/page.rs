//! Index pages and their change status

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use tessera_core::domain::{BlobId, FileId, RemoteFileRecord, TrackedFile};

/// Position of a page slot in the index arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageIdx(pub(crate) usize);

impl PageIdx {
    /// Raw slot number
    pub fn get(self) -> usize {
        self.0
    }
}

impl Display for PageIdx {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What `save` has to do with a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Matches its persisted blob; no I/O
    Unchanged,
    /// Persisted, content or successor changed; rewritten in place
    Modified,
    /// Not persisted yet; posted as a new blob
    Created,
    /// Unlinked from the chain; its blob (if any) is deleted
    Deleted,
}

/// Status of one arena slot, as reported by reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
    pub page: PageIdx,
    pub blob: Option<BlobId>,
    pub status: PageStatus,
    pub files: usize,
}

/// Wire form of a page: records plus the successor's descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredPage {
    pub files: Vec<RemoteFileRecord>,
    pub next: Option<BlobId>,
}

/// One arena slot
#[derive(Debug, Clone)]
pub struct IndexPage {
    pub(crate) blob: Option<BlobId>,
    pub(crate) files: Vec<RemoteFileRecord>,
    pub(crate) next: Option<PageIdx>,
    pub(crate) parent: Option<PageIdx>,
    pub(crate) status: PageStatus,
    /// Successor descriptor as last persisted
    pub(crate) stored_next: Option<BlobId>,
}

impl IndexPage {
    /// A page that exists only in memory
    pub(crate) fn created(parent: Option<PageIdx>) -> Self {
        Self {
            blob: None,
            files: Vec::new(),
            next: None,
            parent,
            status: PageStatus::Created,
            stored_next: None,
        }
    }

    /// A page read from `blob`
    pub(crate) fn loaded(blob: BlobId, stored: StoredPage, parent: Option<PageIdx>) -> Self {
        Self {
            blob: Some(blob),
            files: stored.files,
            next: None,
            parent,
            status: PageStatus::Unchanged,
            stored_next: stored.next,
        }
    }

    /// Blob holding this page, once persisted
    pub fn blob(&self) -> Option<&BlobId> {
        self.blob.as_ref()
    }

    /// Records stored in this page
    pub fn files(&self) -> &[RemoteFileRecord] {
        &self.files
    }

    pub fn status(&self) -> PageStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.status != PageStatus::Deleted
    }

    /// Flag for rewrite; created pages stay created
    pub(crate) fn touch(&mut self) {
        if self.status == PageStatus::Unchanged {
            self.status = PageStatus::Modified;
        }
    }

    pub(crate) fn position(&self, id: &FileId) -> Option<usize> {
        self.files.iter().position(|f| f.id() == id)
    }
}
