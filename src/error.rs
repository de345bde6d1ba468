use std::path::PathBuf;

use thiserror::Error;

use crate::model::{DeviceId, JobId};

/// Boxed cause carried by errors that wrap opaque driver or analyzer failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Custom error types for the Overseer core.
///
/// Errors are grouped by the component that raises them so callers can
/// decide between "reject the request", "skip and log" and "shut down".

/// Main error type for Overseer operations.
#[derive(Debug, Error)]
pub enum OverseerError {
    /// Errors raised by the broadcast channels.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Errors related to plugin bundles and the remote registry.
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Errors related to device type resolution and driver creation.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Errors raised by job sentinels.
    #[error("Sentinel error: {0}")]
    Sentinel(#[from] SentinelError),

    /// Configuration and setup errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Outcomes of a channel read that did not produce an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel has been shut down; callers treat this as a stop signal.
    #[error("channel is closed")]
    Closed,

    /// The reader's cancellation token fired before an item arrived.
    #[error("read was cancelled")]
    Cancelled,
}

/// Errors specific to plugin bundles, installation and the plugin registry.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Reading or writing the plugins directory failed.
    #[error("I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `plugin.json` could not be parsed or written.
    #[error("Invalid plugin metadata at '{}': {reason}", .path.display())]
    Metadata { path: PathBuf, reason: String },

    /// A bundle library could not be loaded.
    #[error("Failed to load plugin library '{}': {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    /// Fetching the remote registry listing failed.
    #[error("Failed to fetch plugin registry from '{url}': {reason}")]
    Registry { url: String, reason: String },

    /// Downloading a bundle archive failed after all retries.
    #[error("Failed to download plugin from '{url}' after {attempts} attempts: {reason}")]
    Download {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The registry item has no download URL.
    #[error("Plugin '{name}' has no download URL")]
    MissingDownloadUrl { name: String },

    /// Extracting a bundle archive failed.
    #[error("Failed to extract plugin archive into '{}': {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },

    /// The plugin is not installed.
    #[error("Plugin '{name}' is not installed")]
    NotInstalled { name: String },
}

/// Errors raised while resolving device types and creating drivers.
///
/// These are configuration errors: they surface to the caller and are
/// never retried.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The device record does not declare a type.
    #[error("Device {device_id} does not specify a device type")]
    MissingType { device_id: DeviceId },

    /// No registered device type carries this name.
    #[error("Device type '{device_type}' could not be found")]
    TypeNotFound { device_type: String },

    /// The device type exists but no driver is bound to it.
    #[error("No driver registered for device type '{device_type}'")]
    NoDriverRegistered { device_type: String },

    /// The device type exists but has no configuration routine.
    #[error("No configuration provider found for device type '{device_type}'")]
    ConfigurationProviderNotFound { device_type: String },

    /// The configuration routine itself failed.
    #[error("Configuring device {device_id} ({device_type}) failed: {source}")]
    Configuration {
        device_id: DeviceId,
        device_type: String,
        #[source]
        source: BoxError,
    },

    /// The driver factory failed to build an instance.
    #[error("Driver for device {device_id} ({device_type}) could not be instantiated: {source}")]
    Instantiation {
        device_id: DeviceId,
        device_type: String,
        #[source]
        source: BoxError,
    },

    /// The requested device does not exist.
    #[error("Device {device_id} not found")]
    DeviceNotFound { device_id: DeviceId },

    /// A job control command sent to the driver failed.
    #[error("Failed to {command} job on device {device_id}: {source}")]
    Command {
        device_id: DeviceId,
        command: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Errors raised by job sentinels and the sentinel service.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// The monitoring loop exceeded its consecutive-failure ceiling.
    #[error("Job monitoring for job {job_id} failed {failures} consecutive times: {source}")]
    Faulted {
        job_id: JobId,
        failures: u32,
        #[source]
        source: BoxError,
    },

    /// The frame source or analyzer could not be started.
    #[error("Failed to start monitoring for job {job_id}: {source}")]
    StartFailed {
        job_id: JobId,
        #[source]
        source: BoxError,
    },

    /// No failure analyzer is available to build a sentinel.
    #[error("No failure analyzer is available")]
    NoAnalyzer,

    /// The job's device does not exist.
    #[error("Device {device_id} for job {job_id} not found")]
    DeviceNotFound { job_id: JobId, device_id: DeviceId },

    /// The device has no camera endpoint to sample.
    #[error("Device {device_id} has no webcam or snapshot URL")]
    MissingCamera { device_id: DeviceId },

    /// The monitoring task panicked or was aborted.
    #[error("Monitoring task for job {job_id} ended abnormally: {reason}")]
    TaskFailed { job_id: JobId, reason: String },
}

/// Errors related to configuration and application setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("Required environment variable '{var_name}' is not set")]
    MissingEnvVar { var_name: String },

    /// Configuration file could not be read or parsed.
    #[error("Failed to read configuration file '{path}': {reason}")]
    FileReadError { path: String, reason: String },

    /// Invalid configuration values provided.
    #[error("Invalid value '{value}' for field '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}
