use std::sync::Arc;

use log::info;

use crate::error::ProviderError;
use crate::model::{Device, DeviceId};
use crate::providers::{DeviceDriver, DeviceProviderRegistry};
use crate::repository::Repository;

/// Pause, resume and cancel jobs by device id through the device's driver.
pub struct ControlManager {
    devices: Arc<dyn Repository<Device>>,
    providers: Arc<DeviceProviderRegistry>,
}

impl ControlManager {
    pub fn new(devices: Arc<dyn Repository<Device>>, providers: Arc<DeviceProviderRegistry>) -> Self {
        Self { devices, providers }
    }

    fn driver(&self, device_id: DeviceId) -> Result<Arc<dyn DeviceDriver>, ProviderError> {
        let device = self
            .devices
            .get(device_id)
            .ok_or(ProviderError::DeviceNotFound { device_id })?;
        self.providers.get_provider(&device)
    }

    pub async fn pause_job(&self, device_id: DeviceId) -> Result<(), ProviderError> {
        let driver = self.driver(device_id)?;
        driver.pause_job().await.map_err(|e| ProviderError::Command {
            device_id,
            command: "pause",
            source: e.into(),
        })?;
        info!("Paused job on device {}", device_id);
        Ok(())
    }

    pub async fn resume_job(&self, device_id: DeviceId) -> Result<(), ProviderError> {
        let driver = self.driver(device_id)?;
        driver.resume_job().await.map_err(|e| ProviderError::Command {
            device_id,
            command: "resume",
            source: e.into(),
        })?;
        info!("Resumed job on device {}", device_id);
        Ok(())
    }

    pub async fn cancel_job(&self, device_id: DeviceId) -> Result<(), ProviderError> {
        let driver = self.driver(device_id)?;
        driver.cancel_job().await.map_err(|e| ProviderError::Command {
            device_id,
            command: "cancel",
            source: e.into(),
        })?;
        info!("Cancelled job on device {}", device_id);
        Ok(())
    }
}
