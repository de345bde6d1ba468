//! Overseer - fleet monitoring core for networked 3D printers.
//!
//! This library connects vendor device drivers, in-process broadcast
//! channels and camera-based job failure detection into one orchestrated
//! system. Drivers and analyzers are contributed by plugins, either
//! compiled in or loaded from bundle libraries at startup.
//!
//! # Core Components
//!
//! * [`channel`] - Multi-subscriber broadcast channels with per-subscriber cursors
//! * [`capabilities`] / [`plugin_loader`] - Plugin capability registry and bundle discovery
//! * [`plugin_manager`] - Install and uninstall bundles from the remote registry
//! * [`providers`] - Device type resolution and the per-device driver cache
//! * [`monitoring`] - Starts drivers for enabled devices and republishes their status
//! * [`sentinel`] / [`sentinel_service`] - Per-job failure monitoring with consensus
//! * [`detector`] / [`image_fetcher`] - Default prototype analyzer and snapshot fetching
//! * [`responder`] / [`control`] / [`alerts`] - Reacting to failures
//! * [`printer`] - Built-in Moonraker driver
//! * [`config`] / [`error`] - Configuration and error types
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use overseer::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let plugins = PluginRegistry::new(&config.plugins_dir);
//! let capabilities = plugins.build_capabilities(&[&printer::MoonrakerPlugin])?;
//! let providers = DeviceProviderRegistry::new(std::sync::Arc::new(capabilities));
//! // Wire the monitoring and sentinel services...
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod capabilities;
pub mod channel;
pub mod config;
pub mod control;
pub mod detector;
pub mod devices;
pub mod error;
pub mod image_fetcher;
pub mod model;
pub mod monitoring;
pub mod plugin_loader;
pub mod plugin_manager;
pub mod printer;
pub mod providers;
pub mod repository;
pub mod responder;
pub mod sentinel;
pub mod sentinel_service;

// Re-export commonly used types for convenience
pub use alerts::AlertService;
pub use capabilities::{CapabilityRegistry, DeviceTypeRegistration, PluginConfiguration};
pub use channel::{BroadcastChannel, Channels};
pub use config::{ApplicationSettings, Config, SettingsProvider, SharedSettings};
pub use control::ControlManager;
pub use detector::{FailureAnalyzer, PrototypeAnalyzer};
pub use devices::DeviceManager;
pub use error::{ChannelError, OverseerError, PluginError, ProviderError, SentinelError};
pub use image_fetcher::SnapshotFetcher;
pub use monitoring::{MonitoringService, RestartMonitoringService};
pub use plugin_loader::PluginRegistry;
pub use plugin_manager::PluginManager;
pub use providers::{DeviceDriver, DeviceProviderRegistry};
pub use repository::{MemoryRepository, Repository};
pub use responder::JobFailureService;
pub use sentinel::{JobSentinel, SentinelState};
pub use sentinel_service::JobSentinelService;
