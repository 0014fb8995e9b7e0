//! Serialized per-provider write queue
//!
//! Every operation that touches a provider's remote state runs as a job on
//! that provider's queue, so at most one job per provider is in flight. Jobs
//! are processed in FIFO order by a single worker task; each caller awaits
//! its own job's result through a oneshot channel.
//!
//! After a job the queue runs its epilogue (index flush + lease release)
//! unless one ran less than `delay` ago. A skipped epilogue is deferred and
//! fires once the queue has been idle until `previous + delay`, so a burst
//! of jobs costs a single flush and the last job is always followed by one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SyncError;

/// Result type for queued jobs
pub type Result<T> = std::result::Result<T, SyncError>;

/// Work run by the queue after a job, debounced by the queue delay
#[async_trait]
pub trait IQueueEpilogue: Send + Sync {
    async fn run(&self) -> Result<()>;
}

type Job = BoxFuture<'static, ()>;

/// Handle to a running write queue
pub struct SerializedWriteQueue {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    epilogues: Arc<AtomicU64>,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerializedWriteQueue {
    /// Start a queue and its worker task
    ///
    /// Must be called from within a Tokio runtime. The creation time counts
    /// as the previous epilogue.
    pub fn new(name: impl Into<String>, epilogue: Arc<dyn IQueueEpilogue>, delay: Duration) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let epilogues = Arc::new(AtomicU64::new(0));
        let stop = CancellationToken::new();

        let worker = Worker {
            name: name.clone(),
            rx,
            epilogue,
            delay,
            pending: pending.clone(),
            epilogues: epilogues.clone(),
            stop: stop.clone(),
            last_epilogue: Instant::now(),
            deferred: false,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            name,
            tx,
            pending,
            epilogues,
            stop,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue `job` and wait for its result
    ///
    /// # Errors
    /// Returns the job's own error, [`SyncError::Drained`] if the queue
    /// stopped before the job ran, or [`SyncError::ShuttingDown`] if the
    /// queue was already stopped.
    pub async fn submit<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if self.stop.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped = async move {
            let _ = reply_tx.send(job.await);
        }
        .boxed();

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(wrapped).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SyncError::ShuttingDown);
        }

        reply_rx.await.map_err(|_| SyncError::Drained)?
    }

    /// Jobs queued or running
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Epilogues run so far
    pub fn epilogue_count(&self) -> u64 {
        self.epilogues.load(Ordering::SeqCst)
    }

    /// Stop the queue
    ///
    /// The running job (and its epilogue) completes, a deferred epilogue is
    /// run, and jobs still queued are answered with [`SyncError::Drained`].
    /// Idempotent.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self
            .worker
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(queue = %self.name, error = %e, "Write queue worker panicked");
            }
        }
    }
}

impl Drop for SerializedWriteQueue {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Worker {
    name: String,
    rx: mpsc::UnboundedReceiver<Job>,
    epilogue: Arc<dyn IQueueEpilogue>,
    delay: Duration,
    pending: Arc<AtomicUsize>,
    epilogues: Arc<AtomicU64>,
    stop: CancellationToken,
    last_epilogue: Instant,
    deferred: bool,
}

impl Worker {
    async fn run(mut self) {
        info!(queue = %self.name, "Write queue started");

        loop {
            let deadline = self.last_epilogue + self.delay;
            let job = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = sleep_until(deadline), if self.deferred => {
                    self.run_epilogue().await;
                    continue;
                }
            };

            job.await;
            self.pending.fetch_sub(1, Ordering::SeqCst);

            if self.last_epilogue.elapsed() >= self.delay {
                self.run_epilogue().await;
            } else {
                debug!(queue = %self.name, "Epilogue deferred");
                self.deferred = true;
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Ok(job) = self.rx.try_recv() {
            // Dropping the job drops its reply sender; the caller sees Drained
            drop(job);
            self.pending.fetch_sub(1, Ordering::SeqCst);
            drained += 1;
        }
        if self.deferred {
            self.run_epilogue().await;
        }

        info!(queue = %self.name, drained, "Write queue stopped");
    }

    async fn run_epilogue(&mut self) {
        if let Err(e) = self.epilogue.run().await {
            warn!(queue = %self.name, error = %e, "Write queue epilogue failed");
        }
        self.epilogues.fetch_add(1, Ordering::SeqCst);
        self.last_epilogue = Instant::now();
        self.deferred = false;
    }
}
