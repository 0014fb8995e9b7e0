//! Local replica
//!
//! In-memory mirror of the files tracked under the sync root, persisted to
//! `<state_dir>/local-index.json`. Every change goes through
//! [`ReplicaState::upsert`], which sets the dirty flag that
//! [`LocalReplica::flush`] checks before writing.
//!
//! Deleted files keep their record as a tombstone. A *removed* file is no
//! longer tracked: its record stays as a removal tombstone so other devices
//! stop syncing it too, but the file itself is left alone and later scans
//! ignore it.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::domain::{
    normalize_relative_path, DeviceId, FileEvent, FileEventType, FileId, FileLocation, FileMeta,
    LocalFileRecord, TrackedFile,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::events::EventBus;
use crate::SyncError;

/// Name of the persisted replica under the state directory
pub const STATE_FILE: &str = "local-index.json";

/// Suffix of files being written; never tracked
const TEMP_SUFFIX: &str = ".tessera-tmp";

/// Changes found by [`LocalReplica::scan`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ScanSummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.modified == 0 && self.deleted == 0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedReplica {
    device: DeviceId,
    files: Vec<LocalFileRecord>,
}

#[derive(Debug, Default)]
struct ReplicaState {
    files: BTreeMap<FileId, LocalFileRecord>,
    dirty: bool,
}

impl ReplicaState {
    fn upsert(&mut self, record: LocalFileRecord) {
        self.files.insert(*record.id(), record);
        self.dirty = true;
    }

    fn find_by_path(&self, relative: &str) -> Option<&LocalFileRecord> {
        // Prefer the live record when a tombstone shares the path
        self.files
            .values()
            .filter(|r| r.meta().relative_path() == relative)
            .max_by_key(|r| r.meta().is_active())
    }

    fn require(&self, id: &FileId) -> Result<&LocalFileRecord, SyncError> {
        self.files
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("local file {id}")))
    }
}

/// A regular file found under the root
struct Observed {
    absolute: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
}

/// Files tracked on this device
pub struct LocalReplica {
    root: PathBuf,
    state_path: PathBuf,
    device: DeviceId,
    events: EventBus,
    state: Mutex<ReplicaState>,
}

impl LocalReplica {
    /// Open the replica, loading persisted state when present
    ///
    /// Creates `root` and `state_dir` if missing.
    pub async fn open(
        root: impl Into<PathBuf>,
        state_dir: impl AsRef<Path>,
        device: DeviceId,
        events: EventBus,
    ) -> Result<Self, SyncError> {
        let root = root.into();
        let state_dir = state_dir.as_ref();
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(state_dir).await?;
        let state_path = state_dir.join(STATE_FILE);

        let mut state = ReplicaState::default();
        match tokio::fs::read(&state_path).await {
            Ok(bytes) => {
                let persisted: PersistedReplica = serde_json::from_slice(&bytes)?;
                if persisted.device != device {
                    warn!(
                        stored = %persisted.device,
                        current = %device,
                        "Local state was written by another device id"
                    );
                }
                state.files = persisted
                    .files
                    .into_iter()
                    .map(|r| (*r.id(), r))
                    .collect();
                info!(files = state.files.len(), "Loaded local replica");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %state_path.display(), "No local state yet");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            root,
            state_path,
            device,
            events,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    fn emit(&self, meta: &FileMeta, kind: FileEventType) {
        self.events.emit_file(FileEvent {
            file: *meta.id(),
            path: meta.relative_path().to_string(),
            kind,
            location: FileLocation::Local,
        });
    }

    /// Start tracking the file at `relative`, or record a new version of it
    pub async fn add_file(&self, relative: &Path) -> Result<FileMeta, SyncError> {
        let normalized = normalize_relative_path(relative)?;
        let observed = observe(&self.root.join(&normalized)).await?;
        let hash = hash_file(&observed.absolute).await?;

        let mut state = self.state.lock().await;
        let (meta, kind) = match state.find_by_path(&normalized).cloned() {
            Some(existing)
                if existing.meta().is_active()
                    && existing.meta().content_hash() == Some(hash.as_str()) =>
            {
                return Ok(existing.into_meta());
            }
            Some(mut existing) => {
                let kind = if existing.meta().is_active() {
                    FileEventType::Updated
                } else {
                    FileEventType::Created
                };
                existing.meta_mut().record_modification(
                    &self.device,
                    hash,
                    observed.size,
                    observed.modified,
                );
                (existing.into_meta(), kind)
            }
            None => (
                FileMeta::new(
                    &self.device,
                    Path::new(&normalized),
                    hash,
                    observed.size,
                    observed.modified,
                )?,
                FileEventType::Created,
            ),
        };

        state.upsert(LocalFileRecord::new(meta.clone()));
        drop(state);
        self.emit(&meta, kind);
        Ok(meta)
    }

    /// Re-read a tracked file's content and bump its clock
    pub async fn record_modification(&self, id: &FileId) -> Result<FileMeta, SyncError> {
        let mut state = self.state.lock().await;
        let mut record = state.require(id)?.clone();
        let observed = observe(&self.root.join(record.meta().relative_path())).await?;
        let hash = hash_file(&observed.absolute).await?;

        record
            .meta_mut()
            .record_modification(&self.device, hash, observed.size, observed.modified);
        let meta = record.meta().clone();
        state.upsert(record);
        drop(state);
        self.emit(&meta, FileEventType::Updated);
        Ok(meta)
    }

    /// Turn a tracked file into a deletion tombstone
    pub async fn record_deletion(&self, id: &FileId) -> Result<FileMeta, SyncError> {
        let mut state = self.state.lock().await;
        let mut record = state.require(id)?.clone();
        record.meta_mut().record_deletion(&self.device, Utc::now());
        let meta = record.meta().clone();
        state.upsert(record);
        drop(state);
        self.emit(&meta, FileEventType::Deleted);
        Ok(meta)
    }

    /// Stop tracking a file, leaving it on disk
    pub async fn remove_file(&self, id: &FileId) -> Result<FileMeta, SyncError> {
        let mut state = self.state.lock().await;
        let mut record = state.require(id)?.clone();
        record.meta_mut().record_removal(&self.device, Utc::now());
        let meta = record.meta().clone();
        state.upsert(record);
        drop(state);
        self.emit(&meta, FileEventType::Removed);
        Ok(meta)
    }

    /// Walk the root and record new, changed and missing files
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn scan(&self) -> Result<ScanSummary, SyncError> {
        let found = walk(&self.root).await?;
        let mut summary = ScanSummary::default();
        let mut events = Vec::new();

        let mut state = self.state.lock().await;
        let mut known: HashMap<String, LocalFileRecord> = HashMap::new();
        for record in state.files.values() {
            let path = record.meta().relative_path();
            if !known.get(path).is_some_and(|cur| cur.meta().is_active()) {
                known.insert(path.to_string(), record.clone());
            }
        }

        for (path, observed) in &found {
            match known.get(path) {
                Some(record) if record.meta().is_removed() => continue,
                Some(record) if record.meta().is_active() => {
                    let meta = record.meta();
                    if meta.size() == observed.size && meta.last_modified() == observed.modified {
                        continue;
                    }
                    let hash = hash_file(&observed.absolute).await?;
                    if meta.content_hash() == Some(hash.as_str()) {
                        continue;
                    }
                    let mut record = record.clone();
                    record.meta_mut().record_modification(
                        &self.device,
                        hash,
                        observed.size,
                        observed.modified,
                    );
                    events.push((record.meta().clone(), FileEventType::Updated));
                    state.upsert(record);
                    summary.modified += 1;
                }
                Some(tombstone) => {
                    // A deleted file reappeared; revive the same identity
                    let hash = hash_file(&observed.absolute).await?;
                    let mut record = tombstone.clone();
                    record.meta_mut().record_modification(
                        &self.device,
                        hash,
                        observed.size,
                        observed.modified,
                    );
                    events.push((record.meta().clone(), FileEventType::Created));
                    state.upsert(record);
                    summary.added += 1;
                }
                None => {
                    let hash = hash_file(&observed.absolute).await?;
                    let meta = FileMeta::new(
                        &self.device,
                        Path::new(path),
                        hash,
                        observed.size,
                        observed.modified,
                    )?;
                    events.push((meta.clone(), FileEventType::Created));
                    state.upsert(LocalFileRecord::new(meta));
                    summary.added += 1;
                }
            }
        }

        for (path, record) in &known {
            if record.meta().is_active() && !found.contains_key(path) {
                let mut record = record.clone();
                record.meta_mut().record_deletion(&self.device, Utc::now());
                events.push((record.meta().clone(), FileEventType::Deleted));
                state.upsert(record);
                summary.deleted += 1;
            }
        }
        drop(state);

        for (meta, kind) in &events {
            self.emit(meta, *kind);
        }
        if !summary.is_empty() {
            info!(
                added = summary.added,
                modified = summary.modified,
                deleted = summary.deleted,
                "Local changes detected"
            );
        }
        Ok(summary)
    }

    /// Current content of a live tracked file
    pub async fn read_content(&self, id: &FileId) -> Result<Vec<u8>, SyncError> {
        let path = {
            let state = self.state.lock().await;
            let record = state.require(id)?;
            if record.meta().is_tombstone() {
                return Err(SyncError::NotFound(format!("local file {id} is a tombstone")));
            }
            self.root.join(record.meta().relative_path())
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SyncError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Install a remote version: write its content and adopt its metadata
    ///
    /// The file is written next to its target and renamed into place. When
    /// the winning version lives at another path, the old file is removed.
    pub async fn apply_remote(&self, meta: FileMeta, content: &[u8]) -> Result<(), SyncError> {
        let target = self.root.join(meta.relative_path());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = temp_path(&target);
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &target).await?;

        let mut state = self.state.lock().await;
        if let Some(previous) = state.files.get(meta.id()) {
            if previous.meta().relative_path() != meta.relative_path() {
                let old = self.root.join(previous.meta().relative_path());
                remove_if_present(&old).await?;
                debug!(from = %old.display(), to = %target.display(), "File moved");
            }
        }
        state.upsert(LocalFileRecord::new(meta));
        Ok(())
    }

    /// Adopt a remote tombstone
    ///
    /// Deletion tombstones delete the local file. Removal tombstones only
    /// stop tracking it.
    pub async fn apply_tombstone(&self, meta: FileMeta) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if meta.is_deleted() {
            let path = state
                .files
                .get(meta.id())
                .map(|r| r.meta().relative_path().to_string())
                .unwrap_or_else(|| meta.relative_path().to_string());
            remove_if_present(&self.root.join(path)).await?;
        }
        state.upsert(LocalFileRecord::new(meta));
        Ok(())
    }

    /// Copy of every record, tombstones included
    pub async fn snapshot(&self) -> Vec<LocalFileRecord> {
        self.state.lock().await.files.values().cloned().collect()
    }

    pub async fn get(&self, id: &FileId) -> Option<LocalFileRecord> {
        self.state.lock().await.files.get(id).cloned()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Persist the replica if it changed since the last flush
    pub async fn flush(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }

        let persisted = PersistedReplica {
            device: self.device.clone(),
            files: state.files.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        let temp = temp_path(&self.state_path);
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.state_path).await?;

        state.dirty = false;
        debug!(files = persisted.files.len(), "Local replica flushed");
        Ok(())
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

async fn remove_if_present(path: &Path) -> Result<(), SyncError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn observe(path: &Path) -> Result<Observed, SyncError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SyncError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Err(SyncError::NotFound(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok(Observed {
        absolute: path.to_path_buf(),
        size: metadata.len(),
        modified: metadata.modified().map(DateTime::<Utc>::from)?,
    })
}

/// Hex SHA-256 of a file's content
async fn hash_file(path: &Path) -> Result<String, SyncError> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Regular files under `root`, keyed by normalized relative path
async fn walk(root: &Path) -> Result<BTreeMap<String, Observed>, SyncError> {
    let mut found = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || path.to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }

            let relative = match path.strip_prefix(root).map(normalize_relative_path) {
                Ok(Ok(relative)) => relative,
                _ => {
                    warn!(path = %path.display(), "Skipping path outside the sync root");
                    continue;
                }
            };
            let metadata = entry.metadata().await?;
            found.insert(
                relative,
                Observed {
                    absolute: path,
                    size: metadata.len(),
                    modified: metadata.modified().map(DateTime::<Utc>::from)?,
                },
            );
        }
    }
    Ok(found)
}
