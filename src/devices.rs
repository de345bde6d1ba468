//! Device create/update/delete/sort on top of the device repository.
//!
//! Every change that affects which drivers should run is announced on the
//! topology channel, which the restart service turns into a monitoring
//! restart.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::channel::TopologyChannel;
use crate::error::ProviderError;
use crate::model::{Device, DeviceId, FieldDescriptor, TopologyChanged};
use crate::providers::DeviceProviderRegistry;
use crate::repository::Repository;

pub struct DeviceManager {
    devices: Arc<dyn Repository<Device>>,
    providers: Arc<DeviceProviderRegistry>,
    topology: TopologyChannel,
}

impl DeviceManager {
    pub fn new(
        devices: Arc<dyn Repository<Device>>,
        providers: Arc<DeviceProviderRegistry>,
        topology: TopologyChannel,
    ) -> Self {
        Self {
            devices,
            providers,
            topology,
        }
    }

    /// All devices in display order.
    pub fn get_devices(&self) -> Vec<Device> {
        let mut devices = self.devices.get_all();
        devices.sort_by_key(|d| (d.sort_index, d.id));
        devices
    }

    pub fn get_device(&self, device_id: DeviceId) -> Option<Device> {
        self.devices.get(device_id)
    }

    /// Field descriptors per device type, for rendering device forms.
    pub fn get_metadata(&self) -> &HashMap<String, Vec<FieldDescriptor>> {
        self.providers.get_metadata()
    }

    /// Configure a new device through its type's configurator and store it.
    ///
    /// # Errors
    ///
    /// Any [`ProviderError`] from [`DeviceProviderRegistry::configure_device`];
    /// nothing is stored in that case.
    pub async fn create_device(&self, mut device: Device) -> Result<Device, ProviderError> {
        device.id = 0;
        device.sort_index = self
            .devices
            .get_all()
            .iter()
            .map(|d| d.sort_index + 1)
            .max()
            .unwrap_or(0);

        let configured = self.providers.configure_device(device).await?;
        let saved = self.devices.save(configured);
        info!("Created device {} ({})", saved.id, saved.name);
        self.topology.publish(TopologyChanged);
        Ok(saved)
    }

    /// Reconfigure and store an existing device. Its cached driver is
    /// dropped so the next monitoring start builds one from the new settings.
    pub async fn update_device(&self, device: Device) -> Result<Device, ProviderError> {
        if self.devices.get(device.id).is_none() {
            return Err(ProviderError::DeviceNotFound {
                device_id: device.id,
            });
        }

        let configured = self.providers.configure_device(device).await?;
        self.retire_driver(configured.id).await;
        let saved = self.devices.save(configured);
        info!("Updated device {} ({})", saved.id, saved.name);
        self.topology.publish(TopologyChanged);
        Ok(saved)
    }

    /// Enable or disable monitoring of a device.
    pub async fn set_disabled(
        &self,
        device_id: DeviceId,
        disabled: bool,
    ) -> Result<Device, ProviderError> {
        let mut device = self
            .devices
            .get(device_id)
            .ok_or(ProviderError::DeviceNotFound { device_id })?;
        device.disabled = disabled;
        if disabled {
            self.retire_driver(device_id).await;
        }
        let saved = self.devices.save(device);
        self.topology.publish(TopologyChanged);
        Ok(saved)
    }

    pub async fn delete_device(&self, device_id: DeviceId) -> Result<Device, ProviderError> {
        let removed = self
            .devices
            .delete(device_id)
            .ok_or(ProviderError::DeviceNotFound { device_id })?;
        self.retire_driver(device_id).await;
        info!("Deleted device {} ({})", removed.id, removed.name);
        self.topology.publish(TopologyChanged);
        Ok(removed)
    }

    /// Assign display order following `ordered_ids`. Unknown ids are ignored.
    pub fn sort_devices(&self, ordered_ids: &[DeviceId]) {
        for (position, device_id) in ordered_ids.iter().enumerate() {
            if let Some(mut device) = self.devices.get(*device_id) {
                device.sort_index = position as i32;
                self.devices.save(device);
            }
        }
    }

    async fn retire_driver(&self, device_id: DeviceId) {
        if let Some(driver) = self.providers.remove_provider(device_id) {
            driver.stop().await;
        }
    }
}
