//! Remote lease on a provider
//!
//! Providers have no compare-and-swap, so mutual exclusion is best effort:
//! a device writes its lease record, waits `settle` for racing writers to
//! land, and reads the record back. Whoever's record survives owns the
//! lease. Holders renew the record periodically while a transfer is in
//! flight and delete it on release.
//!
//! Lease records are plain JSON so any device can inspect them without the
//! shared secret.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tessera_core::config::LeaseConfig;
use tessera_core::domain::{BlobId, DeviceId, LeaseRecord};
use tessera_core::ports::IStorageProvider;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::SyncError;

/// First retry delay of [`LeaseManager::acquire_with_backoff`]
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Upper bound of the retry delay
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Predicate telling the renewal task whether a transfer is in flight
pub type ActivityFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// State of the remote lease as seen by this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// No lease, or our own unexpired lease
    Available,
    /// Another device holds an unexpired lease
    HeldByOther {
        owner: DeviceId,
        expires_at: DateTime<Utc>,
    },
    /// A lease exists but has expired
    Expired { previous_owner: DeviceId },
}

/// Result of a single acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    HeldByOther {
        owner: DeviceId,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct LeaseState {
    held: bool,
    lost: bool,
    /// When our record was last written
    written_at: Option<Instant>,
}

/// Acquires, renews and releases one provider's lease
pub struct LeaseManager {
    provider: Arc<dyn IStorageProvider>,
    device: DeviceId,
    config: LeaseConfig,
    activity: ActivityFn,
    state: Arc<Mutex<LeaseState>>,
    renewal: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LeaseManager {
    /// Create a manager; `activity` gates renewal
    pub fn new(
        provider: Arc<dyn IStorageProvider>,
        device: DeviceId,
        config: LeaseConfig,
        activity: ActivityFn,
    ) -> Self {
        Self {
            provider,
            device,
            config,
            activity,
            state: Arc::new(Mutex::new(LeaseState::default())),
            renewal: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, LeaseState> {
        lock(&self.state)
    }

    /// Read and classify the remote lease record
    pub async fn inspect(&self) -> Result<LeaseStatus, SyncError> {
        let Some(record) = read_record(self.provider.as_ref()).await? else {
            return Ok(LeaseStatus::Available);
        };
        Ok(if record.is_expired() {
            LeaseStatus::Expired {
                previous_owner: record.owner,
            }
        } else if record.is_owned_by(&self.device) {
            LeaseStatus::Available
        } else {
            LeaseStatus::HeldByOther {
                expires_at: record.expires_at(),
                owner: record.owner,
            }
        })
    }

    /// Single acquisition attempt: write, settle, verify
    #[instrument(skip(self), fields(provider = %self.provider.provider_id(), device = %self.device))]
    pub async fn acquire(&self) -> Result<LeaseOutcome, SyncError> {
        if let LeaseStatus::HeldByOther { owner, expires_at } = self.inspect().await? {
            debug!(owner = %owner, "Lease held by another device");
            return Ok(LeaseOutcome::HeldByOther { owner, expires_at });
        }

        write_record(self.provider.as_ref(), &self.device, self.config.duration_ms).await?;
        let written_at = Instant::now();
        tokio::time::sleep(self.config.settle()).await;

        match read_record(self.provider.as_ref()).await? {
            Some(record) if record.is_owned_by(&self.device) => {
                {
                    let mut state = self.state();
                    state.held = true;
                    state.lost = false;
                    state.written_at = Some(written_at);
                }
                self.start_renewal();
                info!("Lease acquired");
                Ok(LeaseOutcome::Acquired)
            }
            Some(record) => {
                debug!(owner = %record.owner, "Lost the lease race");
                Ok(LeaseOutcome::HeldByOther {
                    expires_at: record.expires_at(),
                    owner: record.owner,
                })
            }
            None => {
                // Our record vanished during settle; someone released over us
                Err(SyncError::LockUnavailable {
                    owner: self.device.clone(),
                })
            }
        }
    }

    /// Retry [`acquire`](Self::acquire) with exponential backoff
    ///
    /// # Errors
    /// [`SyncError::LockUnavailable`] once `acquire_timeout` has elapsed,
    /// [`SyncError::ShuttingDown`] when `cancel` fires while waiting.
    pub async fn acquire_with_backoff(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let deadline = Instant::now() + self.config.acquire_timeout();
        let mut delay = INITIAL_BACKOFF;

        loop {
            let owner = match self.acquire().await? {
                LeaseOutcome::Acquired => return Ok(()),
                LeaseOutcome::HeldByOther { owner, .. } => owner,
            };

            if Instant::now() + delay > deadline {
                warn!(
                    provider = %self.provider.provider_id(),
                    owner = %owner,
                    "Giving up on contended lease"
                );
                return Err(SyncError::LockUnavailable { owner });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::ShuttingDown),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    fn start_renewal(&self) {
        let token = CancellationToken::new();
        let task = RenewalTask {
            provider: self.provider.clone(),
            device: self.device.clone(),
            config: self.config.clone(),
            activity: self.activity.clone(),
            state: self.state.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run());

        let previous = lock(&self.renewal).replace((token, handle));
        if let Some((token, _)) = previous {
            token.cancel();
        }
    }

    fn stop_renewal(&self) {
        if let Some((token, _)) = lock(&self.renewal).take() {
            token.cancel();
        }
    }

    /// Stop renewal and delete the lease if we still own it
    ///
    /// Best effort: failures are logged, never returned.
    #[instrument(skip(self), fields(provider = %self.provider.provider_id()))]
    pub async fn release(&self) {
        self.stop_renewal();
        let was_held = {
            let mut state = self.state();
            std::mem::replace(&mut state.held, false)
        };
        if !was_held {
            return;
        }

        match read_record(self.provider.as_ref()).await {
            Ok(Some(record)) if record.is_owned_by(&self.device) => {
                match self.provider.delete(&BlobId::lease()).await {
                    Ok(()) => info!("Lease released"),
                    Err(e) if e.is_not_found() => debug!("Lease already gone"),
                    Err(e) => warn!(error = %e, "Failed to delete lease"),
                }
            }
            Ok(Some(record)) => {
                debug!(owner = %record.owner, "Lease taken over, nothing to release");
            }
            Ok(None) => debug!("No lease to release"),
            Err(e) => warn!(error = %e, "Failed to read lease on release"),
        }
    }

    /// We hold a lease that has neither been lost nor run out
    pub fn is_held(&self) -> bool {
        let state = self.state();
        state.held
            && !state.lost
            && state
                .written_at
                .is_some_and(|at| at.elapsed() < self.config.duration())
    }

    /// Renewal observed another owner since the last acquisition
    pub fn was_lost(&self) -> bool {
        self.state().lost
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_record(provider: &dyn IStorageProvider) -> Result<Option<LeaseRecord>, SyncError> {
    match provider.get(&BlobId::lease()).await {
        Ok(bytes) => match serde_json::from_slice::<LeaseRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable lease record");
                Ok(None)
            }
        },
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_record(
    provider: &dyn IStorageProvider,
    device: &DeviceId,
    duration_ms: u64,
) -> Result<(), SyncError> {
    let record = LeaseRecord::new(device.clone(), duration_ms);
    provider
        .put(&BlobId::lease(), serde_json::to_vec(&record)?)
        .await?;
    Ok(())
}

/// Background task keeping a held lease alive during transfers
struct RenewalTask {
    provider: Arc<dyn IStorageProvider>,
    device: DeviceId,
    config: LeaseConfig,
    activity: ActivityFn,
    state: Arc<Mutex<LeaseState>>,
    token: CancellationToken,
}

impl RenewalTask {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(self.config.renew_interval()) => {}
            }
            if !(self.activity)() {
                continue;
            }

            match read_record(self.provider.as_ref()).await {
                Ok(Some(record)) if record.is_owned_by(&self.device) => {}
                Ok(other) => {
                    warn!(
                        provider = %self.provider.provider_id(),
                        owner = ?other.map(|r| r.owner),
                        "Lease lost during transfer"
                    );
                    let mut state = lock(&self.state);
                    state.lost = true;
                    state.held = false;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Lease check failed, retrying next interval");
                    continue;
                }
            }

            match write_record(self.provider.as_ref(), &self.device, self.config.duration_ms).await
            {
                Ok(()) => {
                    debug!(provider = %self.provider.provider_id(), "Lease renewed");
                    lock(&self.state).written_at = Some(Instant::now());
                }
                Err(e) => warn!(error = %e, "Lease renewal failed"),
            }
        }
    }
}
