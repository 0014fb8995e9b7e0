//! Provider slots and their lifecycle
//!
//! A [`ProviderSlot`] owns everything the engine keeps per provider: the
//! storage adapter, its status, the lease, the provider config, the loaded
//! index and the write queue that serializes every remote mutation.
//!
//! Status transitions:
//!
//! ```text
//! Uninitialized --connect--> Initialized --activate--> Active
//!       |                        |                      |  ^
//!       +--> Unauthorized        +--> Error             |  | enter (re-acquire)
//!                                                       v  |
//!                                                      Expired
//! ```
//!
//! Every transition is broadcast on the [`EventBus`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tessera_core::config::{Config, LeaseConfig};
use tessera_core::domain::{
    BlobId, DeviceId, ProviderConfig, ProviderEvent, ProviderId, ProviderStatus,
    RemoteFileRecord, SharedSecret,
};
use tessera_core::ports::{IStorageProvider, ITransferPipeline, ProviderError};
use tessera_index::{ChunkedRemoteIndex, IndexChange, RemoteFileAction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::events::EventBus;
use crate::lease::LeaseManager;
use crate::write_queue::{IQueueEpilogue, SerializedWriteQueue};
use crate::SyncError;

/// Per-slot tuning taken from the configuration
#[derive(Debug, Clone)]
pub struct SlotSettings {
    pub lease: LeaseConfig,
    pub page_capacity: usize,
    pub write_delay: Duration,
}

impl SlotSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease: config.lease.clone(),
            page_capacity: config.index.page_capacity,
            write_delay: config.write_queue.delay(),
        }
    }
}

struct SlotState {
    config: Option<ProviderConfig>,
    index: ChunkedRemoteIndex,
}

/// Held while a job works on a provider; keeps lease renewal going
pub struct ActiveGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One provider and the state the engine keeps for it
pub struct ProviderSlot {
    id: ProviderId,
    provider: Arc<dyn IStorageProvider>,
    pipeline: Arc<dyn ITransferPipeline>,
    secret: SharedSecret,
    device: DeviceId,
    events: EventBus,
    lease: LeaseManager,
    status: Mutex<ProviderStatus>,
    state: tokio::sync::Mutex<SlotState>,
    in_flight: Arc<AtomicUsize>,
    queue: SerializedWriteQueue,
    activated: AtomicBool,
    cancel: CancellationToken,
}

impl ProviderSlot {
    /// Build a slot and start its write queue
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        provider: Arc<dyn IStorageProvider>,
        pipeline: Arc<dyn ITransferPipeline>,
        secret: SharedSecret,
        device: DeviceId,
        events: EventBus,
        settings: &SlotSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let id = provider.provider_id().clone();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let activity = {
            let in_flight = in_flight.clone();
            Arc::new(move || in_flight.load(Ordering::SeqCst) > 0)
        };
        let lease = LeaseManager::new(
            provider.clone(),
            device.clone(),
            settings.lease.clone(),
            activity,
        );
        let index = ChunkedRemoteIndex::new(
            provider.clone(),
            pipeline.clone(),
            secret.metadata_key(),
            settings.page_capacity,
        );

        Arc::new_cyclic(|weak: &Weak<ProviderSlot>| {
            let queue = SerializedWriteQueue::new(
                id.to_string(),
                Arc::new(FlushEpilogue(weak.clone())),
                settings.write_delay,
            );
            Self {
                id,
                provider,
                pipeline,
                secret,
                device,
                events,
                lease,
                status: Mutex::new(ProviderStatus::Uninitialized),
                state: tokio::sync::Mutex::new(SlotState {
                    config: None,
                    index,
                }),
                in_flight,
                queue,
                activated: AtomicBool::new(false),
                cancel,
            }
        })
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    pub fn provider(&self) -> &Arc<dyn IStorageProvider> {
        &self.provider
    }

    pub fn pipeline(&self) -> &Arc<dyn ITransferPipeline> {
        &self.pipeline
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    pub fn queue(&self) -> &SerializedWriteQueue {
        &self.queue
    }

    pub fn status(&self) -> ProviderStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ProviderStatus) {
        let previous = {
            let mut current = self
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, status)
        };
        if previous != status {
            info!(provider = %self.id, from = %previous, to = %status, "Provider status changed");
            self.events.emit_provider(ProviderEvent {
                provider: self.id.clone(),
                status,
            });
        }
    }

    /// Exclude the provider for the rest of the session
    pub fn mark_error(&self) {
        self.set_status(ProviderStatus::Error);
    }

    /// The lease was lost; the next job re-acquires it
    pub fn mark_expired(&self) {
        self.set_status(ProviderStatus::Expired);
    }

    /// Move the slot to the status a provider-level failure implies
    pub fn record_failure(&self, err: &SyncError) {
        match err {
            SyncError::ProviderUnauthorized(_) => self.set_status(ProviderStatus::Unauthorized),
            SyncError::LockExpired => self.mark_expired(),
            SyncError::ProviderUnavailable(_) | SyncError::Invariant(_) => {
                error!(provider = %self.id, error = %err, "Provider disabled");
                self.mark_error();
            }
            _ => {}
        }
    }

    /// Initialize the backend
    #[instrument(skip(self), fields(provider = %self.id))]
    pub async fn connect(&self) -> ProviderStatus {
        let status = match self.provider.init(&self.device).await {
            Ok(ProviderStatus::Unauthorized) | Err(ProviderError::Unauthorized(_)) => {
                warn!("Provider rejected credentials");
                ProviderStatus::Unauthorized
            }
            Ok(_) => ProviderStatus::Initialized,
            Err(e) => {
                error!(error = %e, "Provider initialization failed");
                ProviderStatus::Error
            }
        };
        self.set_status(status);
        status
    }

    /// Take the lease, load or create the config and load the index
    ///
    /// Runs as a job on the write queue so the queue's epilogue releases
    /// the lease afterwards.
    pub async fn activate(self: &Arc<Self>) -> Result<(), SyncError> {
        let status = self.status();
        if !matches!(status, ProviderStatus::Initialized | ProviderStatus::Expired) {
            return Err(SyncError::Provider(format!(
                "cannot activate provider {} in state {status}",
                self.id
            )));
        }

        let slot = self.clone();
        let result = self
            .queue
            .submit(async move {
                let _guard = slot.track();
                slot.lease.acquire_with_backoff(&slot.cancel).await?;
                slot.activated.store(true, Ordering::SeqCst);
                slot.reload().await
            })
            .await;

        if let Err(e) = &result {
            warn!(provider = %self.id, error = %e, "Activation failed");
            self.record_failure(e);
        }
        result
    }

    fn track(&self) -> ActiveGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    /// Replace the in-memory config and index with the remote ones
    async fn reload(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let config = match self.provider.get(&BlobId::config()).await {
            Ok(sealed) => {
                let plain = self
                    .pipeline
                    .decrypt(&sealed, &self.secret.metadata_key(), None)?;
                serde_json::from_slice::<ProviderConfig>(&plain)?
            }
            Err(e) if e.is_not_found() => {
                info!(provider = %self.id, "No provider config, creating one");
                let config = ProviderConfig::empty(self.id.clone());
                self.write_config(&config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        state.index.load(config.head().cloned()).await?;
        debug!(
            provider = %self.id,
            pages = state.index.page_count(),
            files = state.index.file_count(),
            "Index loaded"
        );
        state.config = Some(config);
        drop(state);

        self.set_status(ProviderStatus::Active);
        Ok(())
    }

    async fn write_config(&self, config: &ProviderConfig) -> Result<(), SyncError> {
        let plain = serde_json::to_vec(config)?;
        let sealed = self
            .pipeline
            .encrypt(&plain, &self.secret.metadata_key(), None)?;
        self.provider.put(&BlobId::config(), sealed).await?;
        Ok(())
    }

    /// Claim the slot for a job
    ///
    /// Skips the lease round trip when the lease is still held. Otherwise
    /// the lease is acquired again and config and index are reloaded, since
    /// another device may have changed them in between.
    ///
    /// # Errors
    /// [`SyncError::LockExpired`] when the lease was lost since the last
    /// job; the slot is then `Expired` and the next call retries.
    pub async fn enter(&self) -> Result<ActiveGuard, SyncError> {
        match self.status() {
            ProviderStatus::Active => {
                if self.lease.was_lost() {
                    warn!(provider = %self.id, "Lease lost since the last job");
                    self.mark_expired();
                    return Err(SyncError::LockExpired);
                }
            }
            ProviderStatus::Expired => {}
            other => {
                return Err(SyncError::ProviderUnavailable(format!(
                    "provider {} is {other}",
                    self.id
                )))
            }
        }

        let guard = self.track();
        if !self.lease.is_held() {
            self.lease.acquire_with_backoff(&self.cancel).await?;
            self.activated.store(true, Ordering::SeqCst);
            self.reload().await?;
        }
        Ok(guard)
    }

    /// Run `f` as a job on this provider's write queue, inside [`enter`](Self::enter)
    pub async fn run<T, F, Fut>(self: &Arc<Self>, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<ProviderSlot>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let slot = self.clone();
        self.queue
            .submit(async move {
                let _guard = slot.enter().await?;
                f(slot.clone()).await
            })
            .await
    }

    /// Records currently in the index
    pub async fn index_files(&self) -> Vec<RemoteFileRecord> {
        self.state.lock().await.index.files().cloned().collect()
    }

    /// Stage record changes; persisted by the next [`flush`](Self::flush)
    pub async fn stage(&self, actions: Vec<RemoteFileAction>) -> Result<Vec<IndexChange>, SyncError> {
        let mut state = self.state.lock().await;
        Ok(state.index.reconcile(actions)?)
    }

    /// Persist staged index changes and release the lease
    ///
    /// Rewrites the provider config when the head page moved. Refuses to
    /// write when the lease is no longer held.
    #[instrument(skip(self), fields(provider = %self.id))]
    pub async fn flush(&self) -> Result<(), SyncError> {
        let result = self.save_pending().await;
        if let Err(e) = &result {
            warn!(error = %e, "Index flush failed");
            self.record_failure(e);
        }
        self.lease.release().await;
        result
    }

    async fn save_pending(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if !state.index.has_pending_changes() {
            return Ok(());
        }
        if !self.lease.is_held() {
            return Err(SyncError::LockExpired);
        }

        let report = state.index.save().await?;
        info!(
            created = report.created,
            modified = report.modified,
            deleted = report.deleted,
            "Index saved"
        );

        if report.head_changed {
            let SlotState { config, .. } = &mut *state;
            if let Some(config) = config.as_mut() {
                config.set_head(report.head.clone());
                self.write_config(config).await?;
            }
        }
        Ok(())
    }

    /// Stop the queue and give the lease back
    pub async fn shutdown(&self) {
        self.queue.stop().await;
        if self.activated.load(Ordering::SeqCst) {
            self.lease.release().await;
        }
    }
}

/// Write-queue epilogue of a slot
struct FlushEpilogue(Weak<ProviderSlot>);

#[async_trait]
impl IQueueEpilogue for FlushEpilogue {
    async fn run(&self) -> Result<(), SyncError> {
        match self.0.upgrade() {
            Some(slot) => slot.flush().await,
            None => Ok(()),
        }
    }
}

/// All provider slots of the engine
pub struct ProviderLifecycle {
    slots: Vec<Arc<ProviderSlot>>,
    cancel: CancellationToken,
}

impl ProviderLifecycle {
    pub fn new(slots: Vec<Arc<ProviderSlot>>, cancel: CancellationToken) -> Self {
        Self { slots, cancel }
    }

    /// Build one slot per provider sharing the pipeline, secret and bus
    pub fn build(
        providers: Vec<Arc<dyn IStorageProvider>>,
        pipeline: Arc<dyn ITransferPipeline>,
        secret: SharedSecret,
        device: DeviceId,
        events: EventBus,
        settings: &SlotSettings,
        cancel: CancellationToken,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| {
                ProviderSlot::new(
                    provider,
                    pipeline.clone(),
                    secret.clone(),
                    device.clone(),
                    events.clone(),
                    settings,
                    cancel.child_token(),
                )
            })
            .collect();
        Self::new(slots, cancel)
    }

    /// Connect and activate every provider concurrently
    pub async fn connect_all(&self) -> Vec<(ProviderId, ProviderStatus)> {
        join_all(self.slots.iter().map(|slot| async move {
            if slot.connect().await == ProviderStatus::Initialized {
                // Failure is already reflected in the slot status
                let _ = slot.activate().await;
            }
        }))
        .await;
        self.statuses()
    }

    /// Retry activation of slots that lost their lease or never got one
    pub async fn revive(&self) {
        let pending = self.slots.iter().filter(|slot| {
            matches!(
                slot.status(),
                ProviderStatus::Expired | ProviderStatus::Initialized
            )
        });
        join_all(pending.map(|slot| async move {
            let _ = slot.activate().await;
        }))
        .await;
    }

    /// Slots taking part in rounds
    pub fn enabled(&self) -> Vec<Arc<ProviderSlot>> {
        self.slots
            .iter()
            .filter(|slot| slot.status() == ProviderStatus::Active)
            .cloned()
            .collect()
    }

    pub fn slot(&self, id: &ProviderId) -> Option<Arc<ProviderSlot>> {
        self.slots.iter().find(|slot| slot.id() == id).cloned()
    }

    pub fn slots(&self) -> &[Arc<ProviderSlot>] {
        &self.slots
    }

    pub fn statuses(&self) -> Vec<(ProviderId, ProviderStatus)> {
        self.slots
            .iter()
            .map(|slot| (slot.id().clone(), slot.status()))
            .collect()
    }

    /// Cancel lease waits, drain every queue and release every lease
    pub async fn shutdown(&self) {
        info!("Shutting down providers");
        self.cancel.cancel();
        join_all(self.slots.iter().map(|slot| slot.shutdown())).await;
    }
}
