//! Event bus for the UI layer
//!
//! Three independent broadcast channels: provider status changes, file
//! events and transfer progress. The bus is owned by whoever builds the
//! engine and handed to the components that publish; there is no global
//! instance.

use tessera_core::domain::{FileEvent, ProgressEvent, ProviderEvent};
use tokio::sync::broadcast;

/// Default buffered events per channel
pub const DEFAULT_CAPACITY: usize = 1024;

/// Publisher side of the three event channels
///
/// Cloning yields another handle to the same channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    provider: broadcast::Sender<ProviderEvent>,
    file: broadcast::Sender<FileEvent>,
    progress: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per channel
    pub fn new(capacity: usize) -> Self {
        let (provider, _) = broadcast::channel(capacity);
        let (file, _) = broadcast::channel(capacity);
        let (progress, _) = broadcast::channel(capacity);
        Self {
            provider,
            file,
            progress,
        }
    }

    // Send errors only mean nobody is listening.

    pub fn emit_provider(&self, event: ProviderEvent) {
        let _ = self.provider.send(event);
    }

    pub fn emit_file(&self, event: FileEvent) {
        let _ = self.file.send(event);
    }

    pub fn emit_progress(&self, event: ProgressEvent) {
        let _ = self.progress.send(event);
    }

    pub fn subscribe_provider(&self) -> broadcast::Receiver<ProviderEvent> {
        self.provider.subscribe()
    }

    pub fn subscribe_files(&self) -> broadcast::Receiver<FileEvent> {
        self.file.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
