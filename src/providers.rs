//! Resolution of device types to drivers and the per-device driver cache.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::capabilities::{CapabilityRegistry, DeviceTypeRegistration};
use crate::error::ProviderError;
use crate::model::{Device, DeviceId, DeviceStatus, FieldDescriptor};

/// Vendor-specific driver bound to exactly one device.
///
/// Drivers poll their device on their own task and push every
/// [`DeviceStatus`] they observe into the sink passed to [`DeviceDriver::start`].
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn device_id(&self) -> DeviceId;

    /// Begin polling. Calling `start` on a running driver restarts it with
    /// the new interval.
    async fn start(
        &self,
        interval: Duration,
        device: &Device,
        sink: mpsc::Sender<DeviceStatus>,
    ) -> Result<()>;

    /// Stop polling. Stopping a stopped driver does nothing.
    async fn stop(&self);

    async fn pause_job(&self) -> Result<()>;

    async fn resume_job(&self) -> Result<()>;

    async fn cancel_job(&self) -> Result<()>;
}

/// Resolves device types and owns the one live driver per device.
pub struct DeviceProviderRegistry {
    capabilities: Arc<CapabilityRegistry>,
    providers: DashMap<DeviceId, Arc<dyn DeviceDriver>>,
    /// Type name to index into `capabilities.device_types()`.
    type_cache: DashMap<String, usize>,
    metadata: OnceLock<HashMap<String, Vec<FieldDescriptor>>>,
}

impl DeviceProviderRegistry {
    pub fn new(capabilities: Arc<CapabilityRegistry>) -> Self {
        Self {
            capabilities,
            providers: DashMap::new(),
            type_cache: DashMap::new(),
            metadata: OnceLock::new(),
        }
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    fn resolve_type(&self, device: &Device) -> Result<&DeviceTypeRegistration, ProviderError> {
        let name = device.device_type.trim();
        if name.is_empty() {
            return Err(ProviderError::MissingType {
                device_id: device.id,
            });
        }

        let types = self.capabilities.device_types();
        if let Some(index) = self.type_cache.get(name).map(|i| *i) {
            if let Some(registration) = types.get(index) {
                return Ok(registration);
            }
        }

        let index = types
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| ProviderError::TypeNotFound {
                device_type: name.to_string(),
            })?;
        self.type_cache.insert(name.to_string(), index);
        Ok(&types[index])
    }

    /// Run the vendor configuration routine for a device.
    ///
    /// # Errors
    ///
    /// * [`ProviderError::MissingType`] if the device declares no type
    /// * [`ProviderError::TypeNotFound`] if the type is not registered
    /// * [`ProviderError::ConfigurationProviderNotFound`] if the type has no configurator
    /// * [`ProviderError::Configuration`] if the routine fails
    pub async fn configure_device(&self, device: Device) -> Result<Device, ProviderError> {
        let registration = self.resolve_type(&device)?;
        let configurator = registration.configurator.clone().ok_or_else(|| {
            ProviderError::ConfigurationProviderNotFound {
                device_type: registration.name.clone(),
            }
        })?;

        let device_id = device.id;
        let device_type = registration.name.clone();
        configurator
            .configure(device)
            .await
            .map_err(|e| ProviderError::Configuration {
                device_id,
                device_type,
                source: e.into(),
            })
    }

    /// Get the cached driver for a device, creating it on first access.
    ///
    /// When callers race on the same device exactly one driver is created
    /// and every caller receives it.
    pub fn get_provider(&self, device: &Device) -> Result<Arc<dyn DeviceDriver>, ProviderError> {
        if let Some(existing) = self.providers.get(&device.id) {
            return Ok(Arc::clone(existing.value()));
        }

        // The vacant entry keeps its shard locked, so racing callers wait for
        // this creation instead of building a second driver.
        match self.providers.entry(device.id) {
            Entry::Occupied(winner) => {
                debug!("Driver for device {} was created concurrently", device.id);
                Ok(Arc::clone(winner.get()))
            }
            Entry::Vacant(slot) => {
                let created = self.create_provider(device)?;
                info!("Created {} driver for device {}", device.device_type, device.id);
                Ok(Arc::clone(slot.insert(created).value()))
            }
        }
    }

    /// Build a new driver for a device without caching it.
    ///
    /// # Errors
    ///
    /// * [`ProviderError::TypeNotFound`] if the type name does not resolve
    /// * [`ProviderError::NoDriverRegistered`] if the type has no driver factory
    /// * [`ProviderError::Instantiation`] if the factory fails
    pub fn create_provider(&self, device: &Device) -> Result<Arc<dyn DeviceDriver>, ProviderError> {
        let registration = self.resolve_type(device)?;
        let factory =
            registration
                .driver
                .as_ref()
                .ok_or_else(|| ProviderError::NoDriverRegistered {
                    device_type: registration.name.clone(),
                })?;

        factory
            .create(device)
            .map_err(|e| ProviderError::Instantiation {
                device_id: device.id,
                device_type: registration.name.clone(),
                source: e.into(),
            })
    }

    /// Field descriptors per device type name, computed once per process.
    ///
    /// Ignored fields are left out.
    pub fn get_metadata(&self) -> &HashMap<String, Vec<FieldDescriptor>> {
        self.metadata.get_or_init(|| {
            self.capabilities
                .device_types()
                .iter()
                .map(|t| {
                    let fields = t.fields.iter().filter(|f| !f.is_ignored).cloned().collect();
                    (t.name.clone(), fields)
                })
                .collect()
        })
    }

    /// Snapshot of the live drivers.
    pub fn providers(&self) -> Vec<Arc<dyn DeviceDriver>> {
        self.providers.iter().map(|p| Arc::clone(p.value())).collect()
    }

    /// The live driver for a device, without creating one.
    pub fn find_provider(&self, device_id: DeviceId) -> Option<Arc<dyn DeviceDriver>> {
        self.providers.get(&device_id).map(|p| Arc::clone(p.value()))
    }

    /// Drop the cached driver of one device.
    pub fn remove_provider(&self, device_id: DeviceId) -> Option<Arc<dyn DeviceDriver>> {
        self.providers.remove(&device_id).map(|(_, driver)| driver)
    }

    /// Drop every cached driver.
    pub fn reset(&self) {
        self.providers.clear();
    }
}
