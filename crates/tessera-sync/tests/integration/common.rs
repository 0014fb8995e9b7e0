//! Shared helpers: a "node" is one device with its own replica and engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tessera_core::config::LeaseConfig;
use tessera_core::domain::{DeviceId, ProviderId, SharedSecret};
use tessera_core::ports::IStorageProvider;
use tessera_provider::{AeadTransferPipeline, MemoryProvider};
use tessera_sync::{
    EventBus, LocalReplica, ProviderLifecycle, SlotSettings, SyncOrchestrator, SyncReport,
};
use tokio_util::sync::CancellationToken;

/// Write-queue debounce used by every node
pub const WRITE_DELAY: Duration = Duration::from_millis(20);

pub fn settings() -> SlotSettings {
    SlotSettings {
        lease: LeaseConfig {
            duration_ms: 5_000,
            renew_interval_ms: 1_000,
            settle_ms: 5,
            acquire_timeout_ms: 2_000,
        },
        page_capacity: 4,
        write_delay: WRITE_DELAY,
    }
}

pub fn store(id: &str) -> Arc<MemoryProvider> {
    Arc::new(MemoryProvider::new(ProviderId::new(id).unwrap()))
}

pub struct Node {
    _dir: TempDir,
    pub root: PathBuf,
    pub events: EventBus,
    pub local: Arc<LocalReplica>,
    pub lifecycle: Arc<ProviderLifecycle>,
    pub orchestrator: SyncOrchestrator,
}

/// Builds a device connected to `providers` and activates them
pub async fn node(device: &str, providers: &[Arc<MemoryProvider>]) -> Node {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let device = DeviceId::new(device).unwrap();
    let events = EventBus::default();

    let local = Arc::new(
        LocalReplica::open(&root, dir.path().join("state"), device.clone(), events.clone())
            .await
            .unwrap(),
    );
    let providers: Vec<Arc<dyn IStorageProvider>> = providers
        .iter()
        .map(|p| p.clone() as Arc<dyn IStorageProvider>)
        .collect();
    let lifecycle = Arc::new(ProviderLifecycle::build(
        providers,
        Arc::new(AeadTransferPipeline::new()),
        SharedSecret::from_bytes([42u8; 32]),
        device,
        events.clone(),
        &settings(),
        CancellationToken::new(),
    ));
    lifecycle.connect_all().await;

    let orchestrator = SyncOrchestrator::new(local.clone(), lifecycle.clone(), events.clone());
    Node {
        _dir: dir,
        root,
        events,
        local,
        lifecycle,
        orchestrator,
    }
}

impl Node {
    pub async fn write(&self, relative: &str, content: &[u8]) {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, content).await.unwrap();
    }

    pub async fn read(&self, relative: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.root.join(relative)).await.ok()
    }

    pub async fn delete(&self, relative: &str) {
        tokio::fs::remove_file(self.root.join(relative)).await.unwrap();
    }

    /// Scan the root, then run one round
    pub async fn sync(&self) -> SyncReport {
        self.local.scan().await.unwrap();
        self.orchestrator.synchronize().await.unwrap()
    }

    /// Wait until every write queue has flushed its index and released its lease
    pub async fn quiesce(&self) {
        tokio::time::sleep(WRITE_DELAY * 10).await;
    }
}
