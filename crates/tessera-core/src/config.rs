//! Configuration module for Tessera.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::{DeviceId, SharedSecret};
use crate::ports::provider::ProviderKind;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Tessera.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub sync: SyncConfig,
    pub lease: LeaseConfig,
    pub index: IndexConfig,
    pub write_queue: WriteQueueConfig,
    pub logging: LoggingConfig,
    pub providers: Vec<ProviderSettings>,
}

/// Identity of this device within the mesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable device id. Generated and persisted under `sync.state_dir` when absent.
    pub id: Option<String>,
    /// Base64 encoded 32-byte secret shared by every device of the mesh.
    pub secret: Option<String>,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root directory of the local replica.
    pub root: PathBuf,
    /// Directory holding the local index and the generated device id.
    pub state_dir: PathBuf,
    /// Seconds between synchronization rounds.
    pub interval_secs: u64,
}

/// Remote lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lifetime of a lease without renewal (ms).
    pub duration_ms: u64,
    /// Renewal period while a transfer is in flight (ms). Must be below `duration_ms`.
    pub renew_interval_ms: u64,
    /// Wait between writing a lease and reading it back to detect racers (ms).
    pub settle_ms: u64,
    /// Give up acquiring a contended lease after this long (ms).
    pub acquire_timeout_ms: u64,
}

/// Remote index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum number of file records per remote index page.
    pub page_capacity: usize,
}

/// Serialized write queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    /// Minimum time between two epilogues (index flush + lease release) (ms).
    pub delay_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// One configured storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Unique provider id (`[A-Za-z0-9._-]`).
    pub id: String,
    /// Backend family.
    pub kind: ProviderKind,
    /// Root directory (`local_folder`).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Base URL (`object_store`).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token (`object_store`, `oauth_drive`).
    #[serde(default)]
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/tessera/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("tessera")
            .join("config.yaml")
    }

    /// Parsed shared secret, if configured and valid.
    pub fn shared_secret(&self) -> Option<SharedSecret> {
        self.device
            .secret
            .as_deref()
            .and_then(|s| SharedSecret::from_base64(s).ok())
    }

    /// Configured device id, if present and valid.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.device.id.as_deref().and_then(|s| DeviceId::new(s).ok())
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl WriteQueueConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Tessera"),
            state_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("tessera"),
            interval_secs: 60,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: 60_000,
            renew_interval_ms: 20_000,
            settle_ms: 500,
            acquire_timeout_ms: 120_000,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { page_capacity: 100 }
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self { delay_ms: 1_000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"lease.duration_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- device ---
        if let Some(id) = &self.device.id {
            if let Err(e) = DeviceId::new(id.as_str()) {
                errors.push(ValidationError {
                    field: "device.id".into(),
                    message: e.to_string(),
                });
            }
        }
        match &self.device.secret {
            None => errors.push(ValidationError {
                field: "device.secret".into(),
                message: "a shared secret is required".into(),
            }),
            Some(secret) => {
                if let Err(e) = SharedSecret::from_base64(secret) {
                    errors.push(ValidationError {
                        field: "device.secret".into(),
                        message: e.to_string(),
                    });
                }
            }
        }

        // --- sync ---
        positive(&mut errors, "sync.interval_secs", self.sync.interval_secs);

        // --- lease ---
        positive(&mut errors, "lease.duration_ms", self.lease.duration_ms);
        positive(&mut errors, "lease.renew_interval_ms", self.lease.renew_interval_ms);
        positive(&mut errors, "lease.acquire_timeout_ms", self.lease.acquire_timeout_ms);
        if self.lease.renew_interval_ms >= self.lease.duration_ms {
            errors.push(ValidationError {
                field: "lease.renew_interval_ms".into(),
                message: format!(
                    "renew_interval_ms ({}) must be below duration_ms ({})",
                    self.lease.renew_interval_ms, self.lease.duration_ms
                ),
            });
        }

        // --- index ---
        positive(&mut errors, "index.page_capacity", self.index.page_capacity as u64);

        // --- write_queue ---
        positive(&mut errors, "write_queue.delay_ms", self.write_queue.delay_ms);

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        // --- providers ---
        let mut seen = HashSet::new();
        for (i, provider) in self.providers.iter().enumerate() {
            let field = |name: &str| format!("providers[{i}].{name}");

            if let Err(e) = crate::domain::ProviderId::new(provider.id.as_str()) {
                errors.push(ValidationError {
                    field: field("id"),
                    message: e.to_string(),
                });
            }
            if !seen.insert(provider.id.as_str()) {
                errors.push(ValidationError {
                    field: field("id"),
                    message: format!("duplicate provider id '{}'", provider.id),
                });
            }
            match provider.kind {
                ProviderKind::LocalFolder if provider.path.is_none() => {
                    errors.push(ValidationError {
                        field: field("path"),
                        message: "required for local_folder providers".into(),
                    });
                }
                ProviderKind::ObjectStore if provider.base_url.is_none() => {
                    errors.push(ValidationError {
                        field: field("base_url"),
                        message: "required for object_store providers".into(),
                    });
                }
                _ => {}
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use tessera_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_root(PathBuf::from("/home/user/Tessera"))
///     .page_capacity(50)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- device ---

    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.config.device.id = Some(id.into());
        self
    }

    pub fn secret(mut self, secret: &SharedSecret) -> Self {
        self.config.device.secret = Some(secret.to_base64());
        self
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn state_dir(mut self, dir: PathBuf) -> Self {
        self.config.sync.state_dir = dir;
        self
    }

    pub fn interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.interval_secs = seconds;
        self
    }

    // --- lease ---

    pub fn lease_duration_ms(mut self, ms: u64) -> Self {
        self.config.lease.duration_ms = ms;
        self
    }

    pub fn lease_renew_interval_ms(mut self, ms: u64) -> Self {
        self.config.lease.renew_interval_ms = ms;
        self
    }

    pub fn lease_settle_ms(mut self, ms: u64) -> Self {
        self.config.lease.settle_ms = ms;
        self
    }

    pub fn lease_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lease.acquire_timeout_ms = ms;
        self
    }

    // --- index / queue ---

    pub fn page_capacity(mut self, capacity: usize) -> Self {
        self.config.index.page_capacity = capacity;
        self
    }

    pub fn write_queue_delay_ms(mut self, ms: u64) -> Self {
        self.config.write_queue.delay_ms = ms;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- providers ---

    pub fn provider(mut self, settings: ProviderSettings) -> Self {
        self.config.providers.push(settings);
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
