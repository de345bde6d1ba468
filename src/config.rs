use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::channel::NotificationChannel;
use crate::error::ConfigError;
use crate::model::{FailureAction, Notification};

/// Process configuration for Overseer loaded from environment variables.
///
/// These values are read once at startup. Settings that may change while
/// the process runs live in [`ApplicationSettings`] instead.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one sub-directory per installed plugin bundle.
    ///
    /// Environment variable: `OVERSEER_PLUGINS_DIR`
    pub plugins_dir: PathBuf,

    /// URL of the remote plugin registry listing.
    ///
    /// Environment variable: `OVERSEER_PLUGIN_REGISTRY_URL`
    pub plugin_registry_url: String,

    /// JSON file containing the device list.
    ///
    /// Environment variable: `OVERSEER_DEVICES_FILE`
    pub devices_file: PathBuf,

    /// Optional JSON file with jobs that are already running at startup.
    ///
    /// Environment variable: `OVERSEER_JOBS_FILE`
    pub jobs_file: Option<PathBuf>,

    /// JSON file mapping failure labels to prototype embeddings.
    ///
    /// Environment variable: `OVERSEER_PROTOTYPES_FILE`
    pub prototypes_file: PathBuf,

    /// Discord webhook URL for failure alerts. Alerts are disabled when unset.
    ///
    /// Environment variable: `DISCORD_WEBHOOK`
    pub discord_webhook: Option<String>,

    /// Initial runtime settings.
    pub settings: ApplicationSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed:
    /// - `OVERSEER_PLUGINS_DIR`: plugin bundles (default: "./plugins")
    /// - `OVERSEER_PLUGIN_REGISTRY_URL`: registry listing (default: [`constants::PLUGIN_REGISTRY_URL`])
    /// - `OVERSEER_DEVICES_FILE`: device list (default: "./devices.json")
    /// - `OVERSEER_JOBS_FILE`: active jobs (optional)
    /// - `OVERSEER_PROTOTYPES_FILE`: prototypes (default: "./prototypes.json")
    /// - `OVERSEER_POLL_INTERVAL_MS`: device poll interval (default: "10000")
    /// - `OVERSEER_AI_MONITORING`: enable job sentinels (default: "true")
    /// - `OVERSEER_FRAME_CAPTURE_RATE`: frames per second sampled by sentinels (default: "0.5")
    /// - `OVERSEER_FAILURE_ACTION`: `alert`, `pause` or `cancel` (default: "pause")
    /// - `DISCORD_WEBHOOK`: Discord webhook URL (optional)
    pub fn load() -> Result<Self, ConfigError> {
        let plugins_dir = PathBuf::from(env_or("OVERSEER_PLUGINS_DIR", "./plugins"));
        let plugin_registry_url =
            env_or("OVERSEER_PLUGIN_REGISTRY_URL", constants::PLUGIN_REGISTRY_URL);
        let devices_file = PathBuf::from(env_or("OVERSEER_DEVICES_FILE", "./devices.json"));
        let jobs_file = std::env::var("OVERSEER_JOBS_FILE").ok().map(PathBuf::from);
        let prototypes_file =
            PathBuf::from(env_or("OVERSEER_PROTOTYPES_FILE", "./prototypes.json"));
        let discord_webhook = std::env::var("DISCORD_WEBHOOK")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let poll_interval_ms = parse_env::<u64>("OVERSEER_POLL_INTERVAL_MS", "10000")?;
        let enable_ai_monitoring = parse_env::<bool>("OVERSEER_AI_MONITORING", "true")?;
        let frame_capture_rate = parse_env::<f64>("OVERSEER_FRAME_CAPTURE_RATE", "0.5")?;
        if !is_valid_frame_capture_rate(frame_capture_rate) {
            return Err(ConfigError::InvalidValue {
                field: "OVERSEER_FRAME_CAPTURE_RATE".to_string(),
                value: frame_capture_rate.to_string(),
                reason: format!(
                    "must be between {} and {} frames per second",
                    constants::MIN_FRAME_CAPTURE_RATE,
                    constants::MAX_FRAME_CAPTURE_RATE
                ),
            });
        }
        let failure_action = parse_env::<FailureAction>("OVERSEER_FAILURE_ACTION", "pause")?;

        Ok(Config {
            plugins_dir,
            plugin_registry_url,
            devices_file,
            jobs_file,
            prototypes_file,
            discord_webhook,
            settings: ApplicationSettings {
                poll_interval: Duration::from_millis(poll_interval_ms),
                enable_ai_monitoring,
                frame_capture_rate,
                failure_action,
            },
        })
    }
}

/// Whether `rate` is a finite frame rate within the supported range.
pub fn is_valid_frame_capture_rate(rate: f64) -> bool {
    rate.is_finite()
        && (constants::MIN_FRAME_CAPTURE_RATE..=constants::MAX_FRAME_CAPTURE_RATE).contains(&rate)
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(var: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env_or(var, default);
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        field: var.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })
}

/// Settings that may change while the process runs.
///
/// Consumers poll these through a [`SettingsProvider`] on every loop
/// iteration, so a change takes effect on the next cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSettings {
    /// How often drivers poll their devices.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Whether job sentinels run at all.
    pub enable_ai_monitoring: bool,

    /// Frames per second sampled by each sentinel.
    pub frame_capture_rate: f64,

    /// Reaction to a consensus failure finding.
    pub failure_action: FailureAction,
}

impl ApplicationSettings {
    /// Delay between two sentinel samples.
    ///
    /// A rate outside the supported range falls back to the default rate.
    pub fn capture_interval(&self) -> Duration {
        let default =
            Duration::from_millis((1000.0 / constants::DEFAULT_FRAME_CAPTURE_RATE) as u64);
        if !is_valid_frame_capture_rate(self.frame_capture_rate) {
            return default;
        }
        Duration::try_from_secs_f64(1.0 / self.frame_capture_rate).unwrap_or(default)
    }
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(constants::DEFAULT_POLL_INTERVAL_MS),
            enable_ai_monitoring: true,
            frame_capture_rate: constants::DEFAULT_FRAME_CAPTURE_RATE,
            failure_action: FailureAction::PauseJob,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Source of the current application settings.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> ApplicationSettings;
}

/// In-memory settings store shared between the services and whatever edits them.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<ApplicationSettings>>,
    notifications: Option<NotificationChannel>,
}

impl SharedSettings {
    pub fn new(settings: ApplicationSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            notifications: None,
        }
    }

    /// Create a store that announces every effective change with
    /// [`Notification::SettingsChanged`].
    pub fn with_notifications(
        settings: ApplicationSettings,
        notifications: NotificationChannel,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            notifications: Some(notifications),
        }
    }

    /// Apply an in-place edit to the settings.
    ///
    /// # Returns
    ///
    /// `true` if the edit changed anything. Only then is a
    /// [`Notification::SettingsChanged`] published.
    pub fn update(&self, edit: impl FnOnce(&mut ApplicationSettings)) -> bool {
        let changed = {
            let mut guard = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = guard.clone();
            edit(&mut guard);
            *guard != before
        };

        if changed {
            info!("Application settings updated");
            if let Some(notifications) = &self.notifications {
                notifications.publish(Notification::SettingsChanged);
            }
        }
        changed
    }
}

impl SettingsProvider for SharedSettings {
    fn settings(&self) -> ApplicationSettings {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Number of verdicts a sentinel collects before it can reach consensus.
    pub const CONSENSUS_WINDOW_SIZE: usize = 20;

    /// Fraction of failing verdicts in a full window that produces a finding.
    pub const CONSENSUS_THRESHOLD: f64 = 0.7;

    /// Consecutive loop errors after which a sentinel gives up.
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

    /// Base backoff after a sentinel loop error, multiplied by the failure count.
    pub const INITIAL_BACKOFF_SECONDS: u64 = 30;

    /// Quiet period after a finding when the job keeps running.
    pub const FINDING_COOLDOWN_SECONDS: u64 = 60;

    /// Maximum attempts for transient network operations (snapshots, downloads).
    pub const MAX_RETRIES: u32 = 3;

    /// Base delay between retries of transient network operations.
    pub const RETRY_DELAY_MILLIS: u64 = 500;

    /// Capacity of the queue between drivers and the monitoring service.
    pub const STATUS_QUEUE_CAPACITY: usize = 256;

    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

    pub const DEFAULT_FRAME_CAPTURE_RATE: f64 = 0.5;

    /// Slowest accepted sentinel sampling rate (one frame per hour).
    pub const MIN_FRAME_CAPTURE_RATE: f64 = 1.0 / 3600.0;

    /// Fastest accepted sentinel sampling rate.
    pub const MAX_FRAME_CAPTURE_RATE: f64 = 30.0;

    /// Name of the bundle metadata file inside each plugin directory.
    pub const PLUGIN_METADATA_FILE: &str = "plugin.json";

    /// Remote listing of installable plugin bundles.
    pub const PLUGIN_REGISTRY_URL: &str =
        "https://raw.githubusercontent.com/OverseerApp/overseer.plugin-registry/refs/heads/main/plugins.json";
}
