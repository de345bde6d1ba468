use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use overseer::channel::Channels;
use overseer::config::{Config, SettingsProvider, SharedSettings};
use overseer::control::ControlManager;
use overseer::detector::{self, PrototypeAnalysisPlugin};
use overseer::model::{Device, MachineJob};
use overseer::monitoring::{MonitoringService, RestartMonitoringService};
use overseer::plugin_loader::PluginRegistry;
use overseer::plugin_manager::PluginManager;
use overseer::printer::MoonrakerPlugin;
use overseer::providers::DeviceProviderRegistry;
use overseer::repository::{MemoryRepository, Repository};
use overseer::responder::JobFailureService;
use overseer::sentinel::SentinelTiming;
use overseer::sentinel_service::JobSentinelService;
use overseer::AlertService;

/// Overseer - fleet monitoring for networked 3D printers.
///
/// Loads plugins, starts a driver for every enabled device, republishes
/// their status and watches active jobs through their cameras. When a job
/// is judged to be failing, the configured action (alert, pause or cancel)
/// is applied and a Discord alert is sent if a webhook is configured.
///
/// # Environment Variables
///
/// Optional (with defaults):
/// * `OVERSEER_PLUGINS_DIR` - Plugin bundle directory (default: "./plugins")
/// * `OVERSEER_PLUGIN_REGISTRY_URL` - Remote plugin registry listing
/// * `OVERSEER_DEVICES_FILE` - Device list JSON (default: "./devices.json")
/// * `OVERSEER_JOBS_FILE` - Active jobs JSON (optional)
/// * `OVERSEER_PROTOTYPES_FILE` - Prototype embeddings JSON (default: "./prototypes.json")
/// * `OVERSEER_POLL_INTERVAL_MS` - Device poll interval (default: "10000")
/// * `OVERSEER_AI_MONITORING` - Enable job sentinels (default: "true")
/// * `OVERSEER_FRAME_CAPTURE_RATE` - Frames per second sampled per job (default: "0.5")
/// * `OVERSEER_FAILURE_ACTION` - `alert`, `pause` or `cancel` (default: "pause")
/// * `DISCORD_WEBHOOK` - Discord webhook URL for alerts
///
/// # Usage
///
/// ```bash
/// export OVERSEER_DEVICES_FILE="./devices.json"
/// export DISCORD_WEBHOOK="https://discord.com/api/webhooks/..."
/// export OVERSEER_FAILURE_ACTION="pause"
/// ./overseer
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let config = Config::load().context(
        "Failed to load configuration. Please check the OVERSEER_* environment variables.",
    )?;

    info!("Overseer starting...");
    info!("Plugins directory: {}", config.plugins_dir.display());

    let prototypes = match detector::load_prototypes(&config.prototypes_file) {
        Ok(prototypes) => Some(prototypes),
        Err(e) => {
            warn!("Job failure detection unavailable: {:#}", e);
            None
        }
    };

    let plugins = PluginRegistry::new(&config.plugins_dir);
    let capabilities = plugins.build_capabilities(&[
        &MoonrakerPlugin,
        &PrototypeAnalysisPlugin::new(prototypes),
    ])?;
    info!(
        "Loaded plugins: {} ({} bundle librar{})",
        capabilities.plugins().join(", "),
        plugins.loaded_count(),
        if plugins.loaded_count() == 1 { "y" } else { "ies" }
    );
    let capabilities = Arc::new(capabilities);

    let plugin_manager = PluginManager::new(
        config.plugin_registry_url.clone(),
        config.plugins_dir.clone(),
    );
    tokio::spawn(async move {
        match plugin_manager.get_plugins().await {
            Ok(listing) => {
                for plugin in listing.iter().filter(|p| p.is_update_available) {
                    info!(
                        "Plugin update available: {} {} -> {}",
                        plugin.name,
                        plugin.installed_version.as_deref().unwrap_or("?"),
                        plugin.version
                    );
                }
            }
            Err(e) => warn!("Could not check the plugin registry: {}", e),
        }
    });

    let devices: Arc<dyn Repository<Device>> =
        Arc::new(load_repository::<Device>(&config.devices_file, "devices"));
    let jobs: Arc<dyn Repository<MachineJob>> = Arc::new(match &config.jobs_file {
        Some(path) => load_repository::<MachineJob>(path, "jobs"),
        None => MemoryRepository::new(),
    });

    let channels = Channels::new();
    let settings =
        SharedSettings::with_notifications(config.settings.clone(), channels.notifications.clone());
    let settings_provider: Arc<dyn SettingsProvider> = Arc::new(settings.clone());
    let providers = Arc::new(DeviceProviderRegistry::new(Arc::clone(&capabilities)));
    let alerts = config.discord_webhook.as_deref().map(AlertService::new);
    if alerts.is_none() {
        info!("DISCORD_WEBHOOK not set; Discord alerts are disabled");
    }

    let monitoring = Arc::new(MonitoringService::new(
        Arc::clone(&devices),
        Arc::clone(&settings_provider),
        Arc::clone(&providers),
        channels.status.clone(),
    ));
    let restart = RestartMonitoringService::new(
        Arc::clone(&monitoring),
        channels.topology.clone(),
        channels.notifications.clone(),
    );
    let sentinels = JobSentinelService::new(
        Arc::clone(&jobs),
        Arc::clone(&devices),
        Arc::clone(&settings_provider),
        Arc::clone(&capabilities),
        channels.notifications.clone(),
        channels.job_failures.clone(),
        alerts.clone(),
        SentinelTiming::default(),
    );
    let control = Arc::new(ControlManager::new(Arc::clone(&devices), Arc::clone(&providers)));
    let responder = JobFailureService::new(
        control,
        Arc::clone(&settings_provider),
        channels.job_failures.clone(),
        channels.notifications.clone(),
        alerts,
    );

    let started = monitoring.start_monitoring().await;
    info!("Monitoring {} device(s)", started.len());

    let shutdown = CancellationToken::new();
    let tasks = vec![
        tokio::spawn({
            let cancel = shutdown.clone();
            async move { restart.run(cancel).await }
        }),
        tokio::spawn({
            let cancel = shutdown.clone();
            async move { sentinels.run(cancel).await }
        }),
        tokio::spawn({
            let cancel = shutdown.clone();
            async move { responder.run(cancel).await }
        }),
    ];

    info!("Overseer initialized successfully. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background service ended abnormally: {}", e);
        }
    }
    monitoring.stop_monitoring().await;
    channels.close_all();
    info!("Overseer stopped");

    Ok(())
}

/// Seed an in-memory repository from a JSON file, starting empty if it cannot be read.
fn load_repository<T>(path: &std::path::Path, what: &str) -> MemoryRepository<T>
where
    T: overseer::repository::Keyed + Clone + serde::de::DeserializeOwned,
{
    match MemoryRepository::from_json_file(path) {
        Ok(repository) => {
            info!("Loaded {} from {}", what, path.display());
            repository
        }
        Err(e) => {
            warn!("Starting with no {}: {}", what, e);
            MemoryRepository::new()
        }
    }
}
