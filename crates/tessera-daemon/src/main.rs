//! Tessera Daemon - Background synchronization service
//!
//! Runs the engine for one device:
//! - Connects every configured provider and takes part in its lease protocol
//! - Scans the sync root and runs a synchronization round every interval
//! - Releases leases and flushes pending index writes on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon wires the adapters from `tessera-provider` into the engine
//! from `tessera-sync`, then enters a loop controlled by a
//! `CancellationToken` that is triggered on receipt of SIGTERM or SIGINT.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tessera_core::config::{Config, LoggingConfig};
use tessera_core::domain::DeviceId;
use tessera_core::ports::IStorageProvider;
use tessera_provider::{build_provider, AeadTransferPipeline};
use tessera_sync::{EventBus, LocalReplica, ProviderLifecycle, SlotSettings, SyncOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// File under `sync.state_dir` holding the generated device id
const DEVICE_ID_FILE: &str = "device-id";

#[derive(Debug, Parser)]
#[command(name = "tesserad", version, about = "Tessera synchronization daemon")]
struct Args {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,
}

// ============================================================================
// Startup helpers
// ============================================================================

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    // Logging is not initialized yet, so the errors go into the message
    let errors = config.validate();
    if !errors.is_empty() {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        bail!("Invalid configuration: {}", details.join("; "));
    }
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    // RUST_LOG overrides the configured level
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Configured device id, else the persisted one, else a new persisted one
async fn resolve_device_id(config: &Config) -> Result<DeviceId> {
    if let Some(id) = &config.device.id {
        return DeviceId::new(id.as_str()).context("Invalid device.id");
    }

    let path = config.sync.state_dir.join(DEVICE_ID_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(stored) => {
            return DeviceId::new(stored.trim())
                .with_context(|| format!("Invalid device id in {}", path.display()));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    }

    let device = DeviceId::generate();
    tokio::fs::create_dir_all(&config.sync.state_dir)
        .await
        .context("Failed to create state directory")?;
    tokio::fs::write(&path, device.as_str())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(device = %device, "Generated device id");
    Ok(device)
}

fn build_providers(config: &Config) -> Result<Vec<Arc<dyn IStorageProvider>>> {
    if config.providers.is_empty() {
        warn!("No providers configured; only local changes will be tracked");
    }
    config
        .providers
        .iter()
        .map(|settings| {
            build_provider(settings)
                .with_context(|| format!("Failed to set up provider '{}'", settings.id))
        })
        .collect()
}

// ============================================================================
// DaemonService
// ============================================================================

/// Engine components wired for one device
struct DaemonService {
    config: Config,
    lifecycle: Arc<ProviderLifecycle>,
    orchestrator: SyncOrchestrator,
    shutdown: CancellationToken,
}

impl DaemonService {
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let device = resolve_device_id(&config).await?;
        let secret = config
            .shared_secret()
            .context("device.secret is missing or invalid")?;
        info!(device = %device, root = %config.sync.root.display(), "Starting engine");

        let events = EventBus::default();
        let local = Arc::new(
            LocalReplica::open(
                config.sync.root.clone(),
                &config.sync.state_dir,
                device.clone(),
                events.clone(),
            )
            .await
            .context("Failed to open local replica")?,
        );

        let lifecycle = Arc::new(ProviderLifecycle::build(
            build_providers(&config)?,
            Arc::new(AeadTransferPipeline::new()),
            secret,
            device,
            events.clone(),
            &SlotSettings::from_config(&config),
            shutdown.child_token(),
        ));
        let orchestrator = SyncOrchestrator::new(local, lifecycle.clone(), events);

        Ok(Self {
            config,
            lifecycle,
            orchestrator,
            shutdown,
        })
    }

    async fn run(&self, once: bool) -> Result<()> {
        for (provider, status) in self.lifecycle.connect_all().await {
            info!(provider = %provider, status = %status, "Provider connected");
        }

        let result = if once {
            self.sync_cycle().await
        } else {
            self.sync_loop().await
        };

        self.lifecycle.shutdown().await;
        result
    }

    /// Scan the root and run one round
    async fn sync_cycle(&self) -> Result<()> {
        let scan = self
            .orchestrator
            .local()
            .scan()
            .await
            .context("Local scan failed")?;
        debug!(
            added = scan.added,
            modified = scan.modified,
            deleted = scan.deleted,
            "Scan completed"
        );

        let report = self
            .orchestrator
            .synchronize()
            .await
            .context("Sync round failed")?;
        if let Ok(json) = serde_json::to_string(&report) {
            debug!(report = %json, "Round report");
        }
        for message in &report.errors {
            warn!(error = %message, "Round error");
        }
        Ok(())
    }

    /// Main synchronization loop, one cycle every `sync.interval_secs`
    async fn sync_loop(&self) -> Result<()> {
        let interval_secs = self.config.sync.interval_secs;
        info!(interval_secs, "Starting sync loop");

        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            if let Err(e) = self.sync_cycle().await {
                error!(error = %format!("{e:#}"), "Sync cycle failed");
            }
        }

        info!("Sync loop terminated");
        Ok(())
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    init_logging(&config.logging);

    info!("Tessera daemon starting (tesserad)");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token).await?;
    let result = service.run(args.once).await;

    match &result {
        Ok(()) => info!("Tessera daemon shut down gracefully"),
        Err(e) => error!(error = %e, "Tessera daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
