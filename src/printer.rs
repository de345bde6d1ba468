use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{
    CapabilityRegistry, DeviceConfigurator, DeviceTypeRegistration, DriverFactory,
    PluginConfiguration,
};
use crate::model::{
    Device, DeviceId, DeviceState, DeviceStatus, DisplayType, FieldDescriptor, JobProgress,
    Temperature, Tool, ToolKind,
};
use crate::providers::DeviceDriver;

/// Device type name under which the built-in Moonraker driver is registered.
pub const MOONRAKER_DEVICE_TYPE: &str = "Moonraker";

/// Device property holding the Moonraker base URL.
pub const URL_PROPERTY: &str = "url";

/// Device property holding the optional Moonraker API key.
pub const API_KEY_PROPERTY: &str = "apiKey";

const STATUS_QUERY: &str =
    "/printer/objects/query?webhooks&print_stats&virtual_sdcard&extruder&heater_bed";

/// HTTP client for one Moonraker instance.
///
/// Wraps the Moonraker API calls used by the driver: status queries and
/// pause/resume/cancel of the current print job.
#[derive(Clone)]
pub struct MoonrakerClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl MoonrakerClient {
    /// Create a client for the provided Moonraker API URL.
    ///
    /// # Arguments
    ///
    /// * `api_url` - Base URL for the Moonraker API (e.g., "http://printer.local:7125")
    /// * `api_key` - Value for the `X-Api-Key` header, when the instance requires one
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build a client from a device's property bag.
    ///
    /// # Errors
    ///
    /// Returns an error if the device has no `url` property.
    pub fn for_device(device: &Device) -> Result<Self> {
        let url = device
            .property_str(URL_PROPERTY)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("device {} has no Moonraker url", device.id))?;
        let api_key = device
            .property_str(API_KEY_PROPERTY)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        Ok(Self::new(url, api_key))
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.api_url, path));
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    async fn post_command(&self, path: &str, action: &str) -> Result<()> {
        let response = self.request(reqwest::Method::POST, path).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to {} print: HTTP {}",
                action,
                response.status()
            ));
        }

        Ok(())
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self.request(reqwest::Method::GET, path).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Moonraker request {} failed: HTTP {}",
                path,
                response.status()
            ));
        }

        Ok(response.json().await?)
    }

    /// Pause the current print job.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails
    /// - The Moonraker API returns an error status
    pub async fn pause_print(&self) -> Result<()> {
        self.post_command("/printer/print/pause", "pause").await
    }

    /// Resume the current print job.
    pub async fn resume_print(&self) -> Result<()> {
        self.post_command("/printer/print/resume", "resume").await
    }

    /// Cancel the current print job.
    pub async fn cancel_print(&self) -> Result<()> {
        self.post_command("/printer/print/cancel", "cancel").await
    }

    /// Get the raw printer status object.
    pub async fn get_printer_status(&self) -> Result<Value> {
        self.get_json(STATUS_QUERY).await
    }

    /// List the Klipper objects the printer exposes.
    pub async fn list_objects(&self) -> Result<Vec<String>> {
        let body = self.get_json("/printer/objects/list").await?;
        let objects = body["result"]["objects"]
            .as_array()
            .context("objects list response has no result.objects array")?;
        Ok(objects
            .iter()
            .filter_map(|o| o.as_str().map(str::to_string))
            .collect())
    }
}

/// Translate a Moonraker status query response into a [`DeviceStatus`].
pub fn parse_status(device_id: DeviceId, body: &Value) -> DeviceStatus {
    let status = &body["result"]["status"];
    let stats = &status["print_stats"];

    let klippy_ready = status["webhooks"]["state"]
        .as_str()
        .is_none_or(|state| state == "ready");
    let state = if !klippy_ready {
        match status["webhooks"]["state"].as_str() {
            Some("startup") => DeviceState::Offline,
            _ => DeviceState::Error,
        }
    } else {
        match stats["state"].as_str().unwrap_or("standby") {
            "printing" => DeviceState::Printing,
            "paused" => DeviceState::Paused,
            "error" => DeviceState::Error,
            "complete" | "cancelled" => DeviceState::Operational,
            _ => DeviceState::Idle,
        }
    };

    let mut result = DeviceStatus::new(device_id, state);

    if matches!(state, DeviceState::Printing | DeviceState::Paused) {
        let fraction = status["virtual_sdcard"]["progress"].as_f64().unwrap_or(0.0);
        let elapsed = stats["print_duration"].as_f64().unwrap_or(0.0).max(0.0);
        let estimated_remaining = (fraction > 0.0)
            .then(|| (elapsed / fraction - elapsed).max(0.0).round() as u64);
        result.progress = Some(JobProgress {
            file_name: stats["filename"].as_str().map(str::to_string),
            percent_complete: (fraction * 100.0).clamp(0.0, 100.0),
            elapsed_seconds: elapsed.round() as u64,
            estimated_remaining_seconds: estimated_remaining,
        });
    }

    let mut temperatures = BTreeMap::new();
    for heater in ["extruder", "heater_bed"] {
        if let Some(actual) = status[heater]["temperature"].as_f64() {
            let target = status[heater]["target"].as_f64().unwrap_or(0.0);
            temperatures.insert(heater.to_string(), Temperature { actual, target });
        }
    }
    result.temperatures = temperatures;

    result
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Built-in driver for Klipper printers behind Moonraker.
pub struct MoonrakerDriver {
    device_id: DeviceId,
    client: MoonrakerClient,
    task: Mutex<Option<PollTask>>,
}

impl MoonrakerDriver {
    pub fn new(device_id: DeviceId, client: MoonrakerClient) -> Self {
        Self {
            device_id,
            client,
            task: Mutex::new(None),
        }
    }

    fn take_task(&self) -> Option<PollTask> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

async fn poll_loop(
    device_id: DeviceId,
    client: MoonrakerClient,
    interval: Duration,
    sink: mpsc::Sender<DeviceStatus>,
    cancel: CancellationToken,
) {
    loop {
        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            body = client.get_printer_status() => match body {
                Ok(body) => parse_status(device_id, &body),
                Err(e) => {
                    warn!("Device {}: status poll failed: {}", device_id, e);
                    DeviceStatus::new(device_id, DeviceState::Offline)
                }
            },
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = sink.send(status) => {
                if sent.is_err() {
                    debug!("Device {}: status sink closed, stopping poll loop", device_id);
                    break;
                }
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Device {}: poll loop stopped", device_id);
}

#[async_trait]
impl DeviceDriver for MoonrakerDriver {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    async fn start(
        &self,
        interval: Duration,
        device: &Device,
        sink: mpsc::Sender<DeviceStatus>,
    ) -> Result<()> {
        self.stop().await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            self.device_id,
            self.client.clone(),
            interval,
            sink,
            cancel.clone(),
        ));
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(PollTask { cancel, handle });

        info!(
            "Polling {} ({}) at {} every {:?}",
            device.name,
            device.id,
            self.client.api_url(),
            interval
        );
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.take_task() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!("Device {}: poll task ended abnormally: {}", self.device_id, e);
            }
        }
    }

    async fn pause_job(&self) -> Result<()> {
        self.client.pause_print().await
    }

    async fn resume_job(&self) -> Result<()> {
        self.client.resume_print().await
    }

    async fn cancel_job(&self) -> Result<()> {
        self.client.cancel_print().await
    }
}

/// Creates [`MoonrakerDriver`]s from device properties.
pub struct MoonrakerDriverFactory;

impl DriverFactory for MoonrakerDriverFactory {
    fn create(&self, device: &Device) -> Result<Arc<dyn DeviceDriver>> {
        let client = MoonrakerClient::for_device(device)?;
        Ok(Arc::new(MoonrakerDriver::new(device.id, client)))
    }
}

/// Discovers heaters and extruders from the printer's Klipper objects.
pub struct MoonrakerConfigurator;

/// Map Klipper object names to tools.
pub fn tools_from_objects(objects: &[String]) -> Vec<Tool> {
    let mut tools = Vec::new();
    let mut heater_index = 0;
    for object in objects {
        if let Some(suffix) = object.strip_prefix("extruder") {
            // "extruder", "extruder1", ... but not "extruder_stepper ..."
            let index = if suffix.is_empty() {
                Some(0)
            } else {
                suffix.parse::<u32>().ok()
            };
            if let Some(index) = index {
                tools.push(Tool {
                    kind: ToolKind::Extruder,
                    index,
                    name: object.clone(),
                });
            }
        } else if object == "heater_bed" || object.starts_with("heater_generic ") {
            tools.push(Tool {
                kind: ToolKind::Heater,
                index: heater_index,
                name: object
                    .strip_prefix("heater_generic ")
                    .unwrap_or("bed")
                    .to_string(),
            });
            heater_index += 1;
        }
    }
    tools
}

#[async_trait]
impl DeviceConfigurator for MoonrakerConfigurator {
    async fn configure(&self, mut device: Device) -> Result<Device> {
        let client = MoonrakerClient::for_device(&device)?;
        let objects = client
            .list_objects()
            .await
            .with_context(|| format!("querying Klipper objects at {}", client.api_url()))?;

        device.tools = tools_from_objects(&objects);
        device.properties.insert(
            URL_PROPERTY.to_string(),
            Value::String(client.api_url().to_string()),
        );
        if device.snapshot_url.as_deref().is_none_or(str::is_empty) {
            device.snapshot_url = Some(format!("{}/webcam/?action=snapshot", client.api_url()));
        }

        info!(
            "Configured Moonraker device {} with {} tool(s)",
            device.id,
            device.tools.len()
        );
        Ok(device)
    }
}

/// Compiled-in plugin registering the Moonraker device type.
pub struct MoonrakerPlugin;

impl PluginConfiguration for MoonrakerPlugin {
    fn name(&self) -> &str {
        "Moonraker"
    }

    fn configure(&self, registry: &mut CapabilityRegistry) {
        registry.register_device_type(
            DeviceTypeRegistration::new(MOONRAKER_DEVICE_TYPE)
                .field(
                    FieldDescriptor::new(URL_PROPERTY, "URL")
                        .description("Base URL of the Moonraker API, e.g. http://printer.local:7125")
                        .required(),
                )
                .field(
                    FieldDescriptor::new(API_KEY_PROPERTY, "API Key")
                        .description("Only needed when Moonraker requires authorization")
                        .sensitive(),
                )
                .field(
                    FieldDescriptor::new("klippyState", "Klippy State")
                        .display_type(DisplayType::UpdateOnly)
                        .ignored(),
                )
                .driver(MoonrakerDriverFactory)
                .configurator(MoonrakerConfigurator),
        );
    }
}
