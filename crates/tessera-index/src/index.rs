//! The chunked remote index
//!
//! ## Lifecycle
//!
//! 1. [`ChunkedRemoteIndex::load`] follows the chain from the head
//!    descriptor and fills the arena (all pages `Unchanged`).
//! 2. [`ChunkedRemoteIndex::reconcile`] applies add / update / delete
//!    intents and marks the touched pages.
//! 3. [`ChunkedRemoteIndex::save`] persists exactly the marked pages and
//!    reports whether the head descriptor changed, in which case the caller
//!    rewrites the provider config.
//!
//! ## Head page
//!
//! Empty non-head pages are unlinked. The head page is never unlinked
//! because its descriptor lives in the provider config: when it empties,
//! it absorbs the records and successor link of the next page instead, so
//! the config only changes when the chain goes from empty to non-empty.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{self, Stream, TryStreamExt};
use serde::Serialize;
use tessera_core::domain::{BlobId, ContentKey, FileId, RemoteFileRecord, TrackedFile};
use tessera_core::ports::{IStorageProvider, ITransferPipeline};
use tracing::{debug, info, instrument};

use crate::page::{IndexChange, IndexPage, PageIdx, PageStatus, StoredPage};
use crate::IndexError;

/// Intent applied to the index by [`ChunkedRemoteIndex::reconcile`]
#[derive(Debug, Clone)]
pub enum RemoteFileAction {
    Add(RemoteFileRecord),
    Update(RemoteFileRecord),
    Delete(FileId),
}

/// Outcome of [`ChunkedRemoteIndex::save`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Pages posted as new blobs
    pub created: usize,
    /// Pages rewritten in place
    pub modified: usize,
    /// Page blobs removed
    pub deleted: usize,
    /// Head descriptor after the save
    pub head: Option<BlobId>,
    /// The head descriptor differs from the one the index was loaded with
    pub head_changed: bool,
}

impl SaveReport {
    /// True when the save performed no provider I/O
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.modified == 0 && self.deleted == 0
    }
}

/// One page as read by [`ChunkedRemoteIndex::pages`]
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub blob: BlobId,
    pub files: Vec<RemoteFileRecord>,
    pub next: Option<BlobId>,
}

/// Borrowed wire form, serialized identically to [`StoredPage`]
#[derive(Serialize)]
struct PageBody<'a> {
    files: &'a [RemoteFileRecord],
    next: Option<&'a BlobId>,
}

/// Paginated index of the records stored on one provider
pub struct ChunkedRemoteIndex {
    provider: Arc<dyn IStorageProvider>,
    pipeline: Arc<dyn ITransferPipeline>,
    key: ContentKey,
    capacity: usize,
    /// Head descriptor as persisted in the provider config
    head_blob: Option<BlobId>,
    pages: Vec<IndexPage>,
    head: Option<PageIdx>,
    locations: HashMap<FileId, PageIdx>,
}

impl ChunkedRemoteIndex {
    /// Create an empty, unloaded index for `provider`
    ///
    /// `key` seals every page; `capacity` is the maximum number of records
    /// per page (at least 1).
    pub fn new(
        provider: Arc<dyn IStorageProvider>,
        pipeline: Arc<dyn ITransferPipeline>,
        key: ContentKey,
        capacity: usize,
    ) -> Self {
        Self {
            provider,
            pipeline,
            key,
            capacity: capacity.max(1),
            head_blob: None,
            pages: Vec::new(),
            head: None,
            locations: HashMap::new(),
        }
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Lazily read the persisted chain, one page per item
    ///
    /// Starts at the head descriptor of the last [`load`](Self::load) or
    /// [`save`](Self::save) and follows successor links. A descriptor seen
    /// twice yields [`IndexError::Invariant`] and ends the stream, so the
    /// stream is finite even on a corrupt chain. Each call starts over.
    pub fn pages(&self) -> impl Stream<Item = Result<LoadedPage, IndexError>> + '_ {
        let start = self.head_blob.clone();
        stream::unfold(
            (start, HashSet::new()),
            move |(next, mut visited): (Option<BlobId>, HashSet<BlobId>)| async move {
                let blob = next?;
                if !visited.insert(blob.clone()) {
                    let err = IndexError::Invariant(format!("page chain revisits {blob}"));
                    return Some((Err(err), (None, visited)));
                }
                match self.fetch_page(&blob).await {
                    Ok(stored) => {
                        let following = stored.next.clone();
                        let page = LoadedPage {
                            blob,
                            files: stored.files,
                            next: stored.next,
                        };
                        Some((Ok(page), (following, visited)))
                    }
                    Err(e) => Some((Err(e), (None, visited))),
                }
            },
        )
    }

    /// Replace the in-memory state with the chain starting at `head`
    #[instrument(skip(self), fields(provider = %self.provider.provider_id()))]
    pub async fn load(&mut self, head: Option<BlobId>) -> Result<(), IndexError> {
        self.head_blob = head;
        let loaded: Vec<LoadedPage> = self.pages().try_collect().await?;

        self.pages.clear();
        self.locations.clear();
        self.head = None;

        for (i, page) in loaded.into_iter().enumerate() {
            let idx = PageIdx(i);
            let parent = i.checked_sub(1).map(PageIdx);
            if let Some(parent) = parent {
                self.pages[parent.0].next = Some(idx);
            }
            for file in &page.files {
                if self.locations.insert(*file.id(), idx).is_some() {
                    return Err(IndexError::Invariant(format!(
                        "file {} stored twice in the chain",
                        file.id()
                    )));
                }
            }
            let stored = StoredPage {
                files: page.files,
                next: page.next,
            };
            self.pages.push(IndexPage::loaded(page.blob, stored, parent));
        }
        if !self.pages.is_empty() {
            self.head = Some(PageIdx(0));
        }

        info!(
            pages = self.pages.len(),
            files = self.locations.len(),
            "Remote index loaded"
        );
        Ok(())
    }

    async fn fetch_page(&self, blob: &BlobId) -> Result<StoredPage, IndexError> {
        let sealed = self.provider.get(blob).await?;
        let plain = self.pipeline.decrypt(&sealed, &self.key, None)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    fn seal_page(&self, idx: PageIdx, next: Option<&BlobId>) -> Result<Vec<u8>, IndexError> {
        let body = PageBody {
            files: &self.pages[idx.0].files,
            next,
        };
        let plain = serde_json::to_vec(&body)?;
        Ok(self.pipeline.encrypt(&plain, &self.key, None)?)
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    /// Apply `actions` in order and return the status of every page slot
    ///
    /// With no actions every page stays [`PageStatus::Unchanged`].
    pub fn reconcile(
        &mut self,
        actions: Vec<RemoteFileAction>,
    ) -> Result<Vec<IndexChange>, IndexError> {
        for action in actions {
            match action {
                RemoteFileAction::Add(record) => self.add(record)?,
                RemoteFileAction::Update(record) => self.update(record)?,
                RemoteFileAction::Delete(id) => self.delete(&id)?,
            }
        }
        Ok(self.changes())
    }

    fn add(&mut self, record: RemoteFileRecord) -> Result<(), IndexError> {
        let id = *record.id();
        if let Some(&idx) = self.locations.get(&id) {
            return self.replace(idx, record);
        }

        let target = self
            .live_chain()
            .into_iter()
            .find(|idx| self.pages[idx.0].files.len() < self.capacity);
        let idx = match target {
            Some(idx) => idx,
            None => self.append_page(),
        };

        let page = &mut self.pages[idx.0];
        page.files.push(record);
        page.touch();
        self.locations.insert(id, idx);
        debug!(file_id = %id, page = %idx, "Record added");
        Ok(())
    }

    fn update(&mut self, record: RemoteFileRecord) -> Result<(), IndexError> {
        match self.locations.get(record.id()) {
            Some(&idx) => self.replace(idx, record),
            None => {
                debug!(file_id = %record.id(), "Update of unknown record, adding");
                self.add(record)
            }
        }
    }

    fn replace(&mut self, idx: PageIdx, record: RemoteFileRecord) -> Result<(), IndexError> {
        let page = &mut self.pages[idx.0];
        let pos = page.position(record.id()).ok_or_else(|| {
            IndexError::Invariant(format!("file {} not found in page {idx}", record.id()))
        })?;
        page.files[pos] = record;
        page.touch();
        Ok(())
    }

    fn delete(&mut self, id: &FileId) -> Result<(), IndexError> {
        let Some(idx) = self.locations.remove(id) else {
            debug!(file_id = %id, "Delete of unknown record ignored");
            return Ok(());
        };

        let page = &mut self.pages[idx.0];
        let pos = page
            .position(id)
            .ok_or_else(|| IndexError::Invariant(format!("file {id} not found in page {idx}")))?;
        page.files.remove(pos);
        page.touch();
        if !page.files.is_empty() {
            return Ok(());
        }

        if self.head == Some(idx) {
            self.absorb_successor(idx);
            Ok(())
        } else {
            self.unlink(idx)
        }
    }

    /// Link a new Created page after the current tail (or as the head)
    fn append_page(&mut self) -> PageIdx {
        let tail = self.live_chain().last().copied();
        let idx = PageIdx(self.pages.len());
        self.pages.push(IndexPage::created(tail));
        match tail {
            Some(tail) => {
                let prev = &mut self.pages[tail.0];
                prev.next = Some(idx);
                prev.touch();
            }
            None => self.head = Some(idx),
        }
        debug!(page = %idx, "Page created");
        idx
    }

    /// Remove an emptied non-head page from the chain
    fn unlink(&mut self, idx: PageIdx) -> Result<(), IndexError> {
        let parent = self.pages[idx.0]
            .parent
            .ok_or_else(|| IndexError::Invariant(format!("page {idx} has no predecessor")))?;
        let next = self.pages[idx.0].next;

        let prev = &mut self.pages[parent.0];
        prev.next = next;
        prev.touch();
        if let Some(next) = next {
            self.pages[next.0].parent = Some(parent);
        }
        self.retire(idx);
        debug!(page = %idx, predecessor = %parent, "Empty page unlinked");
        Ok(())
    }

    /// Refill an emptied head page from its successor
    fn absorb_successor(&mut self, head: PageIdx) {
        let Some(successor) = self.pages[head.0].next else {
            return;
        };

        let files = std::mem::take(&mut self.pages[successor.0].files);
        let after = self.pages[successor.0].next;
        for file in &files {
            self.locations.insert(*file.id(), head);
        }

        let page = &mut self.pages[head.0];
        page.files = files;
        page.next = after;
        page.touch();
        if let Some(after) = after {
            self.pages[after.0].parent = Some(head);
        }
        self.retire(successor);
        debug!(page = %successor, "Head absorbed its successor");
    }

    fn retire(&mut self, idx: PageIdx) {
        let page = &mut self.pages[idx.0];
        page.status = PageStatus::Deleted;
        page.next = None;
        page.parent = None;
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Persist every marked page
    ///
    /// Live pages are written tail to head so each page embeds the final
    /// descriptor of its successor; deleted page blobs are removed last so
    /// no persisted page ever points at a missing blob. `NotFound` on delete
    /// is tolerated. A failed save leaves the remaining marks in place and
    /// can be retried.
    #[instrument(skip(self), fields(provider = %self.provider.provider_id()))]
    pub async fn save(&mut self) -> Result<SaveReport, IndexError> {
        let mut report = SaveReport::default();
        let mut successor: Option<BlobId> = None;

        for idx in self.live_chain().into_iter().rev() {
            match self.pages[idx.0].status {
                PageStatus::Created => {
                    let sealed = self.seal_page(idx, successor.as_ref())?;
                    let blob = self.provider.post(sealed).await?;
                    debug!(page = %idx, blob = %blob, "Page posted");
                    self.pages[idx.0].blob = Some(blob);
                    report.created += 1;
                }
                PageStatus::Modified => {
                    let blob = self.pages[idx.0].blob.clone().ok_or_else(|| {
                        IndexError::Invariant(format!("modified page {idx} was never persisted"))
                    })?;
                    let sealed = self.seal_page(idx, successor.as_ref())?;
                    self.provider.put(&blob, sealed).await?;
                    debug!(page = %idx, blob = %blob, "Page rewritten");
                    report.modified += 1;
                }
                PageStatus::Unchanged => {
                    if self.pages[idx.0].stored_next != successor {
                        return Err(IndexError::Invariant(format!(
                            "unchanged page {idx} has a stale successor link"
                        )));
                    }
                }
                PageStatus::Deleted => {
                    return Err(IndexError::Invariant(format!(
                        "deleted page {idx} is still linked"
                    )));
                }
            }

            let page = &mut self.pages[idx.0];
            page.stored_next = successor;
            page.status = PageStatus::Unchanged;
            successor = page.blob.clone();
        }

        for i in 0..self.pages.len() {
            if self.pages[i].status != PageStatus::Deleted {
                continue;
            }
            let Some(blob) = self.pages[i].blob.clone() else {
                continue;
            };
            match self.provider.delete(&blob).await {
                Ok(()) => report.deleted += 1,
                Err(e) if e.is_not_found() => {
                    debug!(blob = %blob, "Page blob already gone");
                }
                Err(e) => return Err(e.into()),
            }
            self.pages[i].blob = None;
        }

        let head = self.head.and_then(|h| self.pages[h.0].blob.clone());
        report.head_changed = head != self.head_blob;
        report.head = head.clone();
        self.head_blob = head;
        self.compact();

        info!(
            created = report.created,
            modified = report.modified,
            deleted = report.deleted,
            head_changed = report.head_changed,
            "Remote index saved"
        );
        Ok(report)
    }

    /// Drop retired slots and renumber the chain from zero
    fn compact(&mut self) {
        let chain = self.live_chain();
        let mut slots: Vec<Option<IndexPage>> =
            std::mem::take(&mut self.pages).into_iter().map(Some).collect();
        self.locations.clear();

        let last = chain.len().saturating_sub(1);
        for (i, old) in chain.iter().enumerate() {
            let Some(mut page) = slots[old.0].take() else {
                continue;
            };
            let idx = PageIdx(i);
            page.parent = i.checked_sub(1).map(PageIdx);
            page.next = (i < last).then(|| PageIdx(i + 1));
            for file in &page.files {
                self.locations.insert(*file.id(), idx);
            }
            self.pages.push(page);
        }
        self.head = (!self.pages.is_empty()).then_some(PageIdx(0));
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Live pages in chain order
    fn live_chain(&self) -> Vec<PageIdx> {
        let mut chain = Vec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            if chain.len() >= self.pages.len() {
                break;
            }
            chain.push(idx);
            cursor = self.pages[idx.0].next;
        }
        chain
    }

    /// Status of every slot in arena order
    pub fn changes(&self) -> Vec<IndexChange> {
        self.pages
            .iter()
            .enumerate()
            .map(|(i, page)| IndexChange {
                page: PageIdx(i),
                blob: page.blob.clone(),
                status: page.status,
                files: page.files.len(),
            })
            .collect()
    }

    /// Page statuses in arena order
    pub fn statuses(&self) -> Vec<PageStatus> {
        self.pages.iter().map(|p| p.status).collect()
    }

    /// Whether a save would perform I/O
    pub fn has_pending_changes(&self) -> bool {
        self.pages.iter().any(|p| p.status != PageStatus::Unchanged)
    }

    /// Records in chain order
    pub fn files(&self) -> impl Iterator<Item = &RemoteFileRecord> + '_ {
        self.live_chain()
            .into_iter()
            .flat_map(move |idx| self.pages[idx.0].files.iter())
    }

    /// Record with id `id`, if indexed
    pub fn get(&self, id: &FileId) -> Option<&RemoteFileRecord> {
        let idx = self.locations.get(id)?;
        let page = &self.pages[idx.0];
        page.position(id).map(|pos| &page.files[pos])
    }

    /// Number of live pages
    pub fn page_count(&self) -> usize {
        self.live_chain().len()
    }

    /// Number of indexed records
    pub fn file_count(&self) -> usize {
        self.locations.len()
    }

    /// Page slot `idx`
    pub fn page(&self, idx: PageIdx) -> Option<&IndexPage> {
        self.pages.get(idx.0)
    }

    /// Persisted head descriptor
    pub fn head(&self) -> Option<&BlobId> {
        self.head_blob.as_ref()
    }

    /// Maximum records per page
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::Utc;
    use tessera_core::domain::{DeviceId, FileMeta, ProviderId, SharedSecret};
    use tessera_provider::{AeadTransferPipeline, MemoryProvider};

    use super::*;

    struct Fixture {
        provider: Arc<MemoryProvider>,
        pipeline: Arc<AeadTransferPipeline>,
        key: ContentKey,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                provider: Arc::new(MemoryProvider::new(ProviderId::new("mem").unwrap())),
                pipeline: Arc::new(AeadTransferPipeline::new()),
                key: SharedSecret::from_bytes([9u8; 32]).metadata_key(),
            }
        }

        fn index(&self, capacity: usize) -> ChunkedRemoteIndex {
            ChunkedRemoteIndex::new(
                self.provider.clone(),
                self.pipeline.clone(),
                self.key.clone(),
                capacity,
            )
        }

        async fn reload(&self, capacity: usize, head: Option<BlobId>) -> ChunkedRemoteIndex {
            let mut index = self.index(capacity);
            index.load(head).await.expect("load index");
            index
        }
    }

    fn record(n: usize) -> RemoteFileRecord {
        let device = DeviceId::new("dev1").unwrap();
        let meta = FileMeta::new(
            &device,
            Path::new(&format!("dir/file-{n}.txt")),
            format!("hash-{n}"),
            n as u64,
            Utc::now(),
        )
        .unwrap();
        RemoteFileRecord::new(meta, ContentKey::from_bytes([1u8; 32]), BlobId::generate())
    }

    fn adds(records: &[RemoteFileRecord]) -> Vec<RemoteFileAction> {
        records.iter().cloned().map(RemoteFileAction::Add).collect()
    }

    fn ids(index: &ChunkedRemoteIndex) -> Vec<FileId> {
        let mut ids: Vec<FileId> = index.files().map(|f| *f.id()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_for_various_sizes() {
        for (n, k) in [(0, 3), (1, 1), (3, 1), (7, 3), (10, 5), (23, 4), (50, 100)] {
            let fx = Fixture::new();
            let records: Vec<_> = (0..n).map(record).collect();

            let mut index = fx.index(k);
            index.reconcile(adds(&records)).unwrap();
            let report = index.save().await.unwrap();
            assert_eq!(report.head_changed, n > 0, "n={n} k={k}");

            let loaded = fx.reload(k, report.head).await;
            let mut expected: Vec<FileId> = records.iter().map(|r| *r.id()).collect();
            expected.sort();
            assert_eq!(ids(&loaded), expected, "n={n} k={k}");
            assert_eq!(loaded.page_count(), n.div_ceil(k), "n={n} k={k}");
            for r in &records {
                assert_eq!(loaded.get(r.id()), Some(r));
            }
        }
    }

    #[tokio::test]
    async fn test_empty_reconcile_is_unchanged_and_free() {
        let fx = Fixture::new();
        let mut index = fx.index(4);
        index.reconcile(adds(&(0..10).map(record).collect::<Vec<_>>())).unwrap();
        let head = index.save().await.unwrap().head;

        let mut index = fx.reload(4, head).await;
        fx.provider.reset_counts();

        let changes = index.reconcile(Vec::new()).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.status == PageStatus::Unchanged));
        assert!(!index.has_pending_changes());

        let report = index.save().await.unwrap();
        assert!(report.is_noop());
        assert!(!report.head_changed);
        assert_eq!(fx.provider.io_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_delete_all_leaves_no_reachable_files() {
        let fx = Fixture::new();
        let records: Vec<_> = (0..12).map(record).collect();
        let mut index = fx.index(5);
        index.reconcile(adds(&records)).unwrap();
        let head = index.save().await.unwrap().head;

        let mut index = fx.reload(5, head.clone()).await;
        let deletes = records
            .iter()
            .map(|r| RemoteFileAction::Delete(*r.id()))
            .collect();
        index.reconcile(deletes).unwrap();
        let report = index.save().await.unwrap();
        assert!(!report.head_changed, "the emptied head page is kept");
        assert_eq!(report.head, head);

        let loaded = fx.reload(5, report.head).await;
        assert_eq!(loaded.file_count(), 0);
        assert_eq!(loaded.files().count(), 0);
        assert_eq!(loaded.page_count(), 1);
        // Only the empty head page remains
        assert_eq!(fx.provider.len(), 1);
    }

    #[tokio::test]
    async fn test_hundred_adds_make_twenty_pages() {
        let fx = Fixture::new();
        let mut index = fx.index(5);

        let changes = index
            .reconcile(adds(&(0..100).map(record).collect::<Vec<_>>()))
            .unwrap();
        assert_eq!(changes.len(), 20);
        assert!(changes.iter().all(|c| c.status == PageStatus::Created && c.files == 5));

        let report = index.save().await.unwrap();
        assert_eq!(report.created, 20);
        assert_eq!(report.modified, 0);
        assert!(report.head_changed);
        assert_eq!(fx.provider.io_counts().posts, 20);
        assert_eq!(fx.provider.io_counts().puts, 0);

        let loaded = fx.reload(5, report.head).await;
        assert_eq!(loaded.page_count(), 20);
        assert_eq!(loaded.file_count(), 100);
    }

    #[tokio::test]
    async fn test_deleting_first_page_absorbs_successor() {
        let fx = Fixture::new();
        let records: Vec<_> = (0..100).map(record).collect();
        let mut index = fx.index(5);
        index.reconcile(adds(&records)).unwrap();
        let head = index.save().await.unwrap().head;

        let mut index = fx.reload(5, head.clone()).await;
        let second_page_blob = index.page(PageIdx(1)).and_then(|p| p.blob().cloned());
        fx.provider.reset_counts();

        let deletes = records[..5]
            .iter()
            .map(|r| RemoteFileAction::Delete(*r.id()))
            .collect();
        let changes = index.reconcile(deletes).unwrap();
        assert_eq!(changes[0].status, PageStatus::Modified);
        assert_eq!(changes[1].status, PageStatus::Deleted);
        assert!(changes[2..].iter().all(|c| c.status == PageStatus::Unchanged));
        assert_eq!(index.page_count(), 19);
        assert_eq!(index.file_count(), 95);
        assert_eq!(index.get(records[5].id()).map(|r| r.id()), Some(records[5].id()));

        let report = index.save().await.unwrap();
        assert_eq!(report.modified, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.created, 0);
        assert!(!report.head_changed);
        assert_eq!(report.head, head);
        let blob = second_page_blob.expect("second page persisted");
        assert!(!fx.provider.contains(&blob));

        let loaded = fx.reload(5, report.head).await;
        assert_eq!(loaded.page_count(), 19);
        assert_eq!(loaded.file_count(), 95);
    }

    #[tokio::test]
    async fn test_emptied_middle_page_is_unlinked() {
        let fx = Fixture::new();
        let records: Vec<_> = (0..15).map(record).collect();
        let mut index = fx.index(5);
        index.reconcile(adds(&records)).unwrap();
        let head = index.save().await.unwrap().head;

        let mut index = fx.reload(5, head).await;
        fx.provider.reset_counts();
        let deletes = records[5..10]
            .iter()
            .map(|r| RemoteFileAction::Delete(*r.id()))
            .collect();
        let statuses: Vec<_> = index
            .reconcile(deletes)
            .unwrap()
            .into_iter()
            .map(|c| c.status)
            .collect();
        assert_eq!(
            statuses,
            vec![PageStatus::Modified, PageStatus::Deleted, PageStatus::Unchanged]
        );

        let report = index.save().await.unwrap();
        let counts = fx.provider.io_counts();
        assert_eq!((counts.puts, counts.deletes, counts.posts), (1, 1, 0));
        assert_eq!(report.modified, 1);

        let loaded = fx.reload(5, report.head).await;
        assert_eq!(loaded.page_count(), 2);
        assert_eq!(loaded.file_count(), 10);
    }

    #[tokio::test]
    async fn test_head_absorbs_unsaved_successor_without_io() {
        let fx = Fixture::new();
        let first: Vec<_> = (0..5).map(record).collect();
        let mut index = fx.index(5);
        index.reconcile(adds(&first)).unwrap();
        index.save().await.unwrap();

        // Second page exists only in memory
        let second: Vec<_> = (5..8).map(record).collect();
        index.reconcile(adds(&second)).unwrap();
        assert_eq!(index.statuses(), vec![PageStatus::Modified, PageStatus::Created]);

        let deletes = first
            .iter()
            .map(|r| RemoteFileAction::Delete(*r.id()))
            .collect();
        index.reconcile(deletes).unwrap();
        assert_eq!(index.statuses(), vec![PageStatus::Modified, PageStatus::Deleted]);
        assert_eq!(index.page_count(), 1);

        fx.provider.reset_counts();
        let report = index.save().await.unwrap();
        assert_eq!(report.deleted, 0);
        let counts = fx.provider.io_counts();
        assert_eq!((counts.puts, counts.posts, counts.deletes), (1, 0, 0));
        assert_eq!(index.file_count(), 3);
    }

    #[tokio::test]
    async fn test_update_replaces_in_place_and_unknown_falls_back() {
        let fx = Fixture::new();
        let records: Vec<_> = (0..6).map(record).collect();
        let mut index = fx.index(3);
        index.reconcile(adds(&records)).unwrap();
        let head = index.save().await.unwrap().head;
        let mut index = fx.reload(3, head).await;

        let updated = records[4].clone().with_error();
        let fresh = record(99);
        let changes = index
            .reconcile(vec![
                RemoteFileAction::Update(updated),
                RemoteFileAction::Delete(FileId::new()),
            ])
            .unwrap();
        assert_eq!(changes[0].status, PageStatus::Unchanged);
        assert_eq!(changes[1].status, PageStatus::Modified);
        assert!(index.get(records[4].id()).unwrap().has_error());
        assert_eq!(index.file_count(), 6);

        index
            .reconcile(vec![RemoteFileAction::Update(fresh.clone())])
            .unwrap();
        assert_eq!(index.file_count(), 7);
        assert_eq!(index.page_count(), 3);
        assert!(index.get(fresh.id()).is_some());
    }

    #[tokio::test]
    async fn test_add_fills_first_page_with_room() {
        let fx = Fixture::new();
        let records: Vec<_> = (0..6).map(record).collect();
        let mut index = fx.index(3);
        index.reconcile(adds(&records)).unwrap();
        let head = index.save().await.unwrap().head;
        let mut index = fx.reload(3, head).await;

        index
            .reconcile(vec![RemoteFileAction::Delete(*records[0].id())])
            .unwrap();
        index.reconcile(vec![RemoteFileAction::Add(record(7))]).unwrap();
        assert_eq!(index.statuses(), vec![PageStatus::Modified, PageStatus::Unchanged]);
        assert_eq!(index.page_count(), 2);
    }

    #[tokio::test]
    async fn test_cyclic_chain_is_an_invariant_violation() {
        let fx = Fixture::new();
        let a = BlobId::new("page-a").unwrap();
        let b = BlobId::new("page-b").unwrap();
        let seal = |next: &BlobId| {
            let page = StoredPage {
                files: Vec::new(),
                next: Some(next.clone()),
            };
            fx.pipeline
                .encrypt(&serde_json::to_vec(&page).unwrap(), &fx.key, None)
                .unwrap()
        };
        fx.provider.insert_raw(a.clone(), seal(&b));
        fx.provider.insert_raw(b.clone(), seal(&a));

        let mut index = fx.index(5);
        let err = index.load(Some(a)).await.unwrap_err();
        assert!(matches!(err, IndexError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_missing_page_surfaces_provider_error() {
        let fx = Fixture::new();
        let mut index = fx.index(5);
        let err = index
            .load(Some(BlobId::new("missing").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Provider(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_page_stream_is_restartable() {
        let fx = Fixture::new();
        let mut index = fx.index(2);
        index.reconcile(adds(&(0..5).map(record).collect::<Vec<_>>())).unwrap();
        index.save().await.unwrap();

        let first: Vec<LoadedPage> = index.pages().try_collect().await.unwrap();
        let second: Vec<LoadedPage> = index.pages().try_collect().await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.iter().map(|p| &p.blob).collect::<Vec<_>>(),
            second.iter().map(|p| &p.blob).collect::<Vec<_>>()
        );
        assert!(first.last().unwrap().next.is_none());
    }
}
