//! Starts and stops the driver of every enabled device and republishes
//! their status samples on the status channel.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{NotificationChannel, StatusChannel, SubscriberId, TopologyChannel};
use crate::config::{SettingsProvider, constants};
use crate::error::ChannelError;
use crate::model::{Device, DeviceId, DeviceStatus, Notification};
use crate::providers::DeviceProviderRegistry;
use crate::repository::Repository;

struct Forwarder {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    started: Vec<DeviceId>,
}

/// Orchestrates device polling for the whole fleet.
pub struct MonitoringService {
    devices: Arc<dyn Repository<Device>>,
    settings: Arc<dyn SettingsProvider>,
    providers: Arc<DeviceProviderRegistry>,
    status: StatusChannel,
    /// Held across start/stop so the two never interleave.
    running: Mutex<Option<Forwarder>>,
}

impl MonitoringService {
    pub fn new(
        devices: Arc<dyn Repository<Device>>,
        settings: Arc<dyn SettingsProvider>,
        providers: Arc<DeviceProviderRegistry>,
        status: StatusChannel,
    ) -> Self {
        Self {
            devices,
            settings,
            providers,
            status,
            running: Mutex::new(None),
        }
    }

    /// Start a driver for every enabled device.
    ///
    /// A device whose driver cannot be created or started is logged and
    /// skipped. Calling this while monitoring is already running does nothing.
    ///
    /// # Returns
    ///
    /// Ids of the devices whose drivers were started.
    pub async fn start_monitoring(&self) -> Vec<DeviceId> {
        let mut running = self.running.lock().await;
        if let Some(forwarder) = running.as_ref() {
            debug!("Monitoring is already running");
            return forwarder.started.clone();
        }

        let interval = self.settings.settings().poll_interval;
        let (sink, queue) = mpsc::channel(constants::STATUS_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward_statuses(queue, self.status.clone(), cancel.clone()));

        let mut started = Vec::new();
        for device in self.devices.get_all().into_iter().filter(|d| !d.disabled) {
            match self.start_device(&device, interval, sink.clone()).await {
                Ok(()) => started.push(device.id),
                Err(e) => error!(
                    "Failed to start monitoring for device {} ({}): {:#}",
                    device.id, device.name, e
                ),
            }
        }

        info!(
            "Monitoring started for {} device(s), polling every {:?}",
            started.len(),
            interval
        );
        *running = Some(Forwarder {
            cancel,
            handle,
            started: started.clone(),
        });
        started
    }

    async fn start_device(
        &self,
        device: &Device,
        interval: std::time::Duration,
        sink: mpsc::Sender<DeviceStatus>,
    ) -> anyhow::Result<()> {
        let driver = self.providers.get_provider(device)?;
        driver.start(interval, device, sink).await
    }

    /// Stop every live driver and the status forwarder. Idempotent.
    pub async fn stop_monitoring(&self) {
        let mut running = self.running.lock().await;
        let Some(forwarder) = running.take() else {
            return;
        };

        for driver in self.providers.providers() {
            driver.stop().await;
        }

        forwarder.cancel.cancel();
        if let Err(e) = forwarder.handle.await {
            warn!("Status forwarder ended abnormally: {}", e);
        }
        info!("Monitoring stopped");
    }

    /// Stop then start, picking up device and settings changes.
    pub async fn restart_monitoring(&self) -> Vec<DeviceId> {
        self.stop_monitoring().await;
        self.start_monitoring().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

async fn forward_statuses(
    mut queue: mpsc::Receiver<DeviceStatus>,
    status: StatusChannel,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(sample) => status.publish(sample),
                None => break,
            },
        }
    }
    debug!("Status forwarder stopped");
}

/// Restarts monitoring whenever the device topology or the application
/// settings change, so drivers pick up new devices and poll intervals.
pub struct RestartMonitoringService {
    monitoring: Arc<MonitoringService>,
    topology: TopologyChannel,
    notifications: NotificationChannel,
    subscriber_id: SubscriberId,
}

impl RestartMonitoringService {
    /// Subscribes immediately so no signal sent after construction is missed.
    pub fn new(
        monitoring: Arc<MonitoringService>,
        topology: TopologyChannel,
        notifications: NotificationChannel,
    ) -> Self {
        let subscriber_id = Uuid::new_v4();
        topology.subscribe(subscriber_id);
        notifications.subscribe(subscriber_id);
        Self {
            monitoring,
            topology,
            notifications,
            subscriber_id,
        }
    }

    /// Process restart signals until `cancel` fires or a channel closes.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let cause = tokio::select! {
                read = self.topology.read(self.subscriber_id, &cancel) => match read {
                    Ok(_) => "Device topology changed",
                    Err(ChannelError::Cancelled) | Err(ChannelError::Closed) => break,
                },
                read = self.notifications.read(self.subscriber_id, &cancel) => match read {
                    Ok(Notification::SettingsChanged) => "Application settings changed",
                    Ok(_) => continue,
                    Err(ChannelError::Cancelled) | Err(ChannelError::Closed) => break,
                },
            };
            info!("{}, restarting monitoring", cause);
            self.monitoring.restart_monitoring().await;
        }
        self.topology.unsubscribe(self.subscriber_id);
        self.notifications.unsubscribe(self.subscriber_id);
    }
}
