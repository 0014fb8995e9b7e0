//! Synchronization rounds
//!
//! The [`SyncOrchestrator`] brings every replica of every tracked file to
//! the causally newest version.
//!
//! ## Round
//!
//! 1. **Snapshot**: local records plus the index of every enabled provider,
//!    each provider read running as a write-queue job under its lease
//! 2. **Group**: replicas by file id; a group containing two incomparable
//!    clocks is a conflict and is reported and skipped
//! 3. **Winner**: the clock-maximal replica, local on ties
//! 4. **Local**: download and install the winner when the local replica is
//!    behind it
//! 5. **Fan-out**: insert or update the winner on every provider that lacks
//!    it, concurrently, one write-queue job per provider
//!
//! Concurrent calls to [`SyncOrchestrator::synchronize`] share the running
//! round.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tessera_core::domain::{
    ClockOrdering, FileEvent, FileEventType, FileId, FileLocation, FileMeta, LocalFileRecord,
    ProgressEvent, ProviderId, RemoteFileRecord, TrackedFile, TransferDirection,
};
use tessera_core::ports::ProgressFn;
use tessera_index::RemoteFileAction;
use tracing::{debug, error, info, instrument, warn};

use crate::events::EventBus;
use crate::lifecycle::{ProviderLifecycle, ProviderSlot};
use crate::local::LocalReplica;
use crate::SyncError;

// ============================================================================
// SyncReport
// ============================================================================

/// Summary of a completed round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Distinct file ids examined
    pub files_checked: usize,
    /// Remote versions installed locally, tombstones included
    pub applied_local: usize,
    /// Content uploads to providers
    pub uploaded: usize,
    /// Tombstones written to providers
    pub remote_deleted: usize,
    /// Files left untouched because replicas diverged
    pub conflicts: Vec<FileId>,
    /// File-level and provider-level failures (non-fatal)
    pub errors: Vec<String>,
    /// Wall-clock duration of the round in milliseconds
    pub duration_ms: u64,
}

type RoundFuture = Shared<BoxFuture<'static, Result<SyncReport, Arc<SyncError>>>>;

// ============================================================================
// Replica selection
// ============================================================================

/// Change a provider needs to converge on the winner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteAction {
    Insert,
    Update,
}

/// True if any two replicas were modified independently
fn has_conflict(metas: &[&FileMeta]) -> bool {
    metas.iter().enumerate().any(|(i, a)| {
        metas[i + 1..]
            .iter()
            .any(|b| a.compare(b) == ClockOrdering::Conflict)
    })
}

/// Index of the newest replica
///
/// On ties an intact replica beats one flagged with a transfer error,
/// otherwise the earliest wins.
fn pick_winner(candidates: &[Candidate]) -> usize {
    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        match candidate.meta.compare(&candidates[best].meta) {
            ClockOrdering::Newer => best = i,
            ClockOrdering::Equal if candidates[best].is_flagged() && !candidate.is_flagged() => {
                best = i
            }
            _ => {}
        }
    }
    best
}

fn remote_action(existing: Option<&RemoteFileRecord>, winner: &FileMeta) -> Option<RemoteAction> {
    let Some(existing) = existing else {
        return Some(RemoteAction::Insert);
    };
    match existing.meta().compare(winner) {
        ClockOrdering::Older => Some(RemoteAction::Update),
        ClockOrdering::Equal if existing.has_error() => Some(RemoteAction::Update),
        _ => None,
    }
}

fn progress_sink(
    events: &EventBus,
    file: FileId,
    provider: ProviderId,
    direction: TransferDirection,
) -> impl Fn(u64, u64) + Send + Sync {
    let events = events.clone();
    move |bytes_done, bytes_total| {
        events.emit_progress(ProgressEvent {
            file,
            provider: provider.clone(),
            direction,
            bytes_done,
            bytes_total,
        })
    }
}

// ============================================================================
// Provider jobs
// ============================================================================

async fn fetch_content(
    slot: &ProviderSlot,
    record: &RemoteFileRecord,
    events: &EventBus,
) -> Result<Vec<u8>, SyncError> {
    let (Some(blob), Some(key)) = (record.blob(), record.content_key()) else {
        return Err(SyncError::NotFound(format!(
            "content of {} on {}",
            record.id(),
            slot.id()
        )));
    };
    let sealed = slot.provider().get(blob).await?;
    let sink = progress_sink(events, *record.id(), slot.id().clone(), TransferDirection::Download);
    let progress: ProgressFn<'_> = &sink;
    Ok(slot.pipeline().decrypt(&sealed, key, Some(progress))?)
}

/// Download a record's content; a file-level failure flags the record
async fn download(
    slot: Arc<ProviderSlot>,
    record: RemoteFileRecord,
    events: EventBus,
) -> Result<Vec<u8>, SyncError> {
    slot.run(move |slot| async move {
        let result = fetch_content(&slot, &record, &events).await;
        if let Err(e) = &result {
            if !e.is_provider_level() && !e.is_fatal() && !record.has_error() {
                slot.stage(vec![RemoteFileAction::Update(record.clone().with_error())])
                    .await?;
            }
        }
        result
    })
    .await
}

async fn seal_winner(
    slot: &ProviderSlot,
    winner: &FileMeta,
    content: Option<&[u8]>,
    events: &EventBus,
) -> Result<RemoteFileRecord, SyncError> {
    if winner.is_tombstone() {
        return Ok(RemoteFileRecord::tombstone(winner.clone()));
    }
    let content =
        content.ok_or_else(|| SyncError::NotFound(format!("content of {}", winner.id())))?;

    let key = slot.pipeline().generate_key();
    let sink = progress_sink(events, *winner.id(), slot.id().clone(), TransferDirection::Upload);
    let progress: ProgressFn<'_> = &sink;
    let sealed = slot.pipeline().encrypt(content, &key, Some(progress))?;
    let blob = slot.provider().post(sealed).await?;
    Ok(RemoteFileRecord::new(winner.clone(), key, blob))
}

/// Write the winner to one provider and stage the index change
///
/// A failed insert stages nothing. A failed update flags the existing
/// record so the next round retries it.
async fn push(
    slot: Arc<ProviderSlot>,
    action: RemoteAction,
    winner: FileMeta,
    existing: Option<RemoteFileRecord>,
    content: Option<Arc<Vec<u8>>>,
    events: EventBus,
) -> Result<(), SyncError> {
    slot.run(move |slot| async move {
        let sealed = seal_winner(&slot, &winner, content.as_deref().map(Vec::as_slice), &events).await;
        match (sealed, action) {
            (Ok(record), RemoteAction::Insert) => {
                slot.stage(vec![RemoteFileAction::Add(record)]).await?;
                Ok(())
            }
            (Ok(record), RemoteAction::Update) => {
                slot.stage(vec![RemoteFileAction::Update(record)]).await?;
                if let Some(old) = existing.as_ref().and_then(RemoteFileRecord::blob) {
                    match slot.provider().delete(old).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => warn!(blob = %old, error = %e, "Failed to delete replaced blob"),
                    }
                }
                Ok(())
            }
            (Err(e), RemoteAction::Update) if !e.is_provider_level() && !e.is_fatal() => {
                if let Some(existing) = existing {
                    slot.stage(vec![RemoteFileAction::Update(existing.with_error())])
                        .await?;
                }
                Err(e)
            }
            (Err(e), _) => Err(e),
        }
    })
    .await
}

// ============================================================================
// Round
// ============================================================================

struct RemoteView {
    slot: Arc<ProviderSlot>,
    files: HashMap<FileId, RemoteFileRecord>,
}

struct Candidate {
    meta: FileMeta,
    /// Position in `Round::remotes` and the record, for remote replicas
    remote: Option<(usize, RemoteFileRecord)>,
}

impl Candidate {
    fn is_flagged(&self) -> bool {
        self.remote.as_ref().is_some_and(|(_, record)| record.has_error())
    }
}

/// What the local step leaves for the fan-out
enum LocalOutcome {
    /// The local replica failed to converge; leave providers alone
    Skip,
    /// Fan out, reusing downloaded content when there is some
    Ready(Option<Arc<Vec<u8>>>),
}

struct Round<'a> {
    inner: &'a Inner,
    remotes: Vec<RemoteView>,
    dropped: HashSet<ProviderId>,
    report: SyncReport,
}

impl Round<'_> {
    fn emit(&self, meta: &FileMeta, kind: FileEventType, location: FileLocation) {
        self.inner.events.emit_file(FileEvent {
            file: *meta.id(),
            path: meta.relative_path().to_string(),
            kind,
            location,
        });
    }

    fn is_dropped(&self, slot: &ProviderSlot) -> bool {
        self.dropped.contains(slot.id())
    }

    /// Route a provider job failure; only invariant violations propagate
    fn provider_failure(
        &mut self,
        slot: &ProviderSlot,
        meta: Option<&FileMeta>,
        err: SyncError,
    ) -> Result<(), SyncError> {
        if err.is_fatal() {
            error!(provider = %slot.id(), error = %err, "Aborting round");
            slot.record_failure(&err);
            return Err(err);
        }

        if err.is_provider_level() {
            error!(provider = %slot.id(), error = %err, "Provider dropped from round");
            slot.record_failure(&err);
            self.dropped.insert(slot.id().clone());
        } else if let Some(meta) = meta {
            warn!(provider = %slot.id(), path = %meta.relative_path(), error = %err, "File transfer failed");
            self.emit(meta, FileEventType::Error, FileLocation::Remote(slot.id().clone()));
        }

        self.report.errors.push(match meta {
            Some(meta) => format!("{}: {}: {err}", slot.id(), meta.relative_path()),
            None => format!("{}: {err}", slot.id()),
        });
        Ok(())
    }

    fn local_failure(&mut self, meta: &FileMeta, err: SyncError) {
        warn!(path = %meta.relative_path(), error = %err, "Local update failed");
        self.emit(meta, FileEventType::Error, FileLocation::Local);
        self.report
            .errors
            .push(format!("local: {}: {err}", meta.relative_path()));
    }

    async fn snapshot_remotes(&mut self) -> Result<(), SyncError> {
        let slots = self.inner.lifecycle.enabled();
        let reads = join_all(slots.into_iter().map(|slot| async move {
            let result = slot
                .run(|slot| async move { Ok(slot.index_files().await) })
                .await;
            (slot, result)
        }))
        .await;

        for (slot, result) in reads {
            match result {
                Ok(files) => {
                    debug!(provider = %slot.id(), files = files.len(), "Remote snapshot");
                    let files = files.into_iter().map(|r| (*r.id(), r)).collect();
                    self.remotes.push(RemoteView { slot, files });
                }
                Err(e) => self.provider_failure(&slot, None, e)?,
            }
        }
        Ok(())
    }

    async fn reconcile_file(
        &mut self,
        id: FileId,
        local: Option<&LocalFileRecord>,
    ) -> Result<(), SyncError> {
        let mut candidates = Vec::new();
        if let Some(local) = local {
            candidates.push(Candidate {
                meta: local.meta().clone(),
                remote: None,
            });
        }
        for (idx, view) in self.remotes.iter().enumerate() {
            if self.is_dropped(&view.slot) {
                continue;
            }
            if let Some(record) = view.files.get(&id) {
                candidates.push(Candidate {
                    meta: record.meta().clone(),
                    remote: Some((idx, record.clone())),
                });
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }
        self.report.files_checked += 1;

        let metas: Vec<&FileMeta> = candidates.iter().map(|c| &c.meta).collect();
        if has_conflict(&metas) {
            warn!(file = %id, path = %metas[0].relative_path(), "Conflicting replicas, skipping");
            self.emit(metas[0], FileEventType::Conflicted, FileLocation::Local);
            self.report.conflicts.push(id);
            return Ok(());
        }
        let winner = pick_winner(&candidates);

        match self.apply_local(local, &candidates, winner).await? {
            LocalOutcome::Skip => Ok(()),
            LocalOutcome::Ready(content) => self.fan_out(&candidates[winner].meta, content).await,
        }
    }

    /// Bring the local replica to the winner
    ///
    /// Content comes from the winning provider, or from another provider
    /// holding the same version when that download fails.
    async fn apply_local(
        &mut self,
        local: Option<&LocalFileRecord>,
        candidates: &[Candidate],
        winner: usize,
    ) -> Result<LocalOutcome, SyncError> {
        let winner = &candidates[winner];
        let up_to_date =
            local.is_some_and(|l| l.meta().compare(&winner.meta) == ClockOrdering::Equal);
        if up_to_date || winner.remote.is_none() {
            return Ok(LocalOutcome::Ready(None));
        }
        let meta = &winner.meta;
        self.emit(meta, FileEventType::Unsynched, FileLocation::Local);

        if meta.is_tombstone() {
            if let Err(e) = self.inner.local.apply_tombstone(meta.clone()).await {
                self.local_failure(meta, e);
                return Ok(LocalOutcome::Skip);
            }
            self.report.applied_local += 1;
            let kind = if meta.is_deleted() {
                FileEventType::Deleted
            } else {
                FileEventType::Removed
            };
            self.emit(meta, kind, FileLocation::Local);
            return Ok(LocalOutcome::Ready(None));
        }

        // The winner first, then every other replica of the same version
        let sources = winner.remote.iter().chain(
            candidates
                .iter()
                .filter(|c| !std::ptr::eq(*c, winner))
                .filter(|c| c.meta.compare(meta) == ClockOrdering::Equal)
                .filter_map(|c| c.remote.as_ref()),
        );
        let mut content = None;
        for (idx, record) in sources {
            let slot = self.remotes[*idx].slot.clone();
            if self.is_dropped(&slot) {
                continue;
            }
            match download(slot.clone(), record.clone(), self.inner.events.clone()).await {
                Ok(bytes) => {
                    content = Some(bytes);
                    break;
                }
                Err(e) => self.provider_failure(&slot, Some(meta), e)?,
            }
        }
        let Some(bytes) = content else {
            return Ok(LocalOutcome::Skip);
        };
        if let Err(e) = self.inner.local.apply_remote(meta.clone(), &bytes).await {
            self.local_failure(meta, e);
            return Ok(LocalOutcome::Skip);
        }

        self.report.applied_local += 1;
        self.emit(meta, FileEventType::Synched, FileLocation::Local);
        Ok(LocalOutcome::Ready(Some(Arc::new(bytes))))
    }

    async fn fan_out(
        &mut self,
        winner: &FileMeta,
        mut content: Option<Arc<Vec<u8>>>,
    ) -> Result<(), SyncError> {
        let targets: Vec<_> = self
            .remotes
            .iter()
            .filter(|view| !self.is_dropped(&view.slot))
            .filter_map(|view| {
                let existing = view.files.get(winner.id());
                remote_action(existing, winner)
                    .map(|action| (view.slot.clone(), action, existing.cloned()))
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        if !winner.is_tombstone() && content.is_none() {
            match self.inner.local.read_content(winner.id()).await {
                Ok(bytes) => content = Some(Arc::new(bytes)),
                Err(e) => {
                    self.local_failure(winner, e);
                    return Ok(());
                }
            }
        }

        let events = &self.inner.events;
        let jobs = targets.into_iter().map(|(slot, action, existing)| {
            let job = push(
                slot.clone(),
                action,
                winner.clone(),
                existing,
                content.clone(),
                events.clone(),
            );
            async move { (slot, action, job.await) }
        });

        for (slot, action, result) in join_all(jobs).await {
            match result {
                Ok(()) => {
                    debug!(provider = %slot.id(), path = %winner.relative_path(), ?action, "Remote replica written");
                    if winner.is_tombstone() {
                        self.report.remote_deleted += 1;
                    } else {
                        self.report.uploaded += 1;
                    }
                    self.emit(
                        winner,
                        FileEventType::Synched,
                        FileLocation::Remote(slot.id().clone()),
                    );
                }
                Err(e) => self.provider_failure(&slot, Some(winner), e)?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// SyncOrchestrator
// ============================================================================

struct Inner {
    local: Arc<LocalReplica>,
    lifecycle: Arc<ProviderLifecycle>,
    events: EventBus,
}

impl Inner {
    #[instrument(skip(self))]
    async fn run_round(&self) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        self.lifecycle.revive().await;

        let mut round = Round {
            inner: self,
            remotes: Vec::new(),
            dropped: HashSet::new(),
            report: SyncReport::default(),
        };
        round.snapshot_remotes().await?;

        let local: HashMap<FileId, LocalFileRecord> = self
            .local
            .snapshot()
            .await
            .into_iter()
            .map(|r| (*r.id(), r))
            .collect();
        let ids: BTreeSet<FileId> = local
            .keys()
            .copied()
            .chain(round.remotes.iter().flat_map(|v| v.files.keys().copied()))
            .collect();

        for id in ids {
            round.reconcile_file(id, local.get(&id)).await?;
        }
        self.local.flush().await?;

        let mut report = round.report;
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            checked = report.files_checked,
            applied_local = report.applied_local,
            uploaded = report.uploaded,
            remote_deleted = report.remote_deleted,
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Sync round complete"
        );
        Ok(report)
    }
}

/// Runs synchronization rounds over the local replica and the enabled providers
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
    current: Arc<Mutex<Option<(u64, RoundFuture)>>>,
    rounds: AtomicU64,
}

impl SyncOrchestrator {
    pub fn new(local: Arc<LocalReplica>, lifecycle: Arc<ProviderLifecycle>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                lifecycle,
                events,
            }),
            current: Arc::new(Mutex::new(None)),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &Arc<LocalReplica> {
        &self.inner.local
    }

    pub fn lifecycle(&self) -> &Arc<ProviderLifecycle> {
        &self.inner.lifecycle
    }

    /// Rounds started so far
    pub fn rounds_started(&self) -> u64 {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Run a round, or join the one already running
    ///
    /// # Errors
    /// Only invariant violations and local state I/O fail a round; every
    /// other failure is recorded in [`SyncReport::errors`].
    pub async fn synchronize(&self) -> Result<SyncReport, Arc<SyncError>> {
        let round = {
            let mut current = lock(&self.current);
            match current.as_ref() {
                Some((_, round)) => round.clone(),
                None => {
                    let generation = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = self.inner.clone();
                    let memo = self.current.clone();
                    let round = async move {
                        let result = inner.run_round().await.map_err(Arc::new);
                        let mut current = lock(&memo);
                        if matches!(current.as_ref(), Some((g, _)) if *g == generation) {
                            *current = None;
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *current = Some((generation, round.clone()));
                    round
                }
            }
        };
        round.await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::Utc;
    use tessera_core::domain::{BlobId, ContentKey, DeviceId, VectorClock};

    use super::*;

    fn meta_with(id: FileId, clock: &[(&str, u64)]) -> FileMeta {
        let mut vc = VectorClock::new();
        for (device, count) in clock {
            let device = DeviceId::new(*device).unwrap();
            for _ in 0..*count {
                vc.increment(&device);
            }
        }
        FileMeta::with_identity(id, vc, Path::new("f.txt"), Some("h".into()), 1, Utc::now())
            .unwrap()
    }

    #[test]
    fn test_conflict_needs_incomparable_pair() {
        let id = FileId::new();
        let a = meta_with(id, &[("dev1", 1)]);
        let b = meta_with(id, &[("dev2", 1)]);
        let c = meta_with(id, &[("dev1", 1), ("dev2", 1)]);

        assert!(has_conflict(&[&a, &b]));
        assert!(has_conflict(&[&c, &a, &b]));
        assert!(!has_conflict(&[&a, &c]));
        assert!(!has_conflict(&[&a]));
    }

    fn local(meta: &FileMeta) -> Candidate {
        Candidate {
            meta: meta.clone(),
            remote: None,
        }
    }

    fn remote(idx: usize, meta: &FileMeta, flagged: bool) -> Candidate {
        let record = RemoteFileRecord::new(
            meta.clone(),
            ContentKey::from_bytes([1u8; 32]),
            BlobId::new("b1").unwrap(),
        );
        let record = if flagged { record.with_error() } else { record };
        Candidate {
            meta: meta.clone(),
            remote: Some((idx, record)),
        }
    }

    #[test]
    fn test_winner_prefers_first_on_ties() {
        let id = FileId::new();
        let old = meta_with(id, &[("dev1", 1)]);
        let new = meta_with(id, &[("dev1", 2)]);

        assert_eq!(pick_winner(&[local(&old), remote(0, &new, false)]), 1);
        assert_eq!(pick_winner(&[local(&new), remote(0, &old, false)]), 0);
        assert_eq!(pick_winner(&[local(&new), remote(0, &new, false)]), 0);
        assert_eq!(pick_winner(&[remote(0, &new, false), remote(1, &new, false)]), 0);
    }

    #[test]
    fn test_winner_skips_flagged_replica_on_ties() {
        let id = FileId::new();
        let old = meta_with(id, &[("dev1", 1)]);
        let new = meta_with(id, &[("dev1", 2)]);

        assert_eq!(pick_winner(&[remote(0, &new, true), remote(1, &new, false)]), 1);
        // A newer version still wins even when flagged
        assert_eq!(pick_winner(&[remote(0, &old, false), remote(1, &new, true)]), 1);
        assert_eq!(pick_winner(&[remote(0, &new, true), remote(1, &new, true)]), 0);
    }

    #[test]
    fn test_remote_action_chain() {
        let id = FileId::new();
        let winner = meta_with(id, &[("dev1", 2)]);
        let key = ContentKey::from_bytes([1u8; 32]);
        let blob = BlobId::new("b1").unwrap();

        assert_eq!(remote_action(None, &winner), Some(RemoteAction::Insert));

        let stale = RemoteFileRecord::new(meta_with(id, &[("dev1", 1)]), key.clone(), blob.clone());
        assert_eq!(remote_action(Some(&stale), &winner), Some(RemoteAction::Update));

        let current = RemoteFileRecord::new(winner.clone(), key, blob);
        assert_eq!(remote_action(Some(&current), &winner), None);
        assert_eq!(
            remote_action(Some(&current.clone().with_error()), &winner),
            Some(RemoteAction::Update)
        );
    }
}
