//! Keeps one sentinel running per active job while AI monitoring is enabled.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alerts::AlertService;
use crate::capabilities::CapabilityRegistry;
use crate::channel::{JobFailureChannel, NotificationChannel, SubscriberId};
use crate::config::SettingsProvider;
use crate::error::{ChannelError, SentinelError};
use crate::model::{Device, DeviceId, JobId, JobNotificationKind, MachineJob, Notification};
use crate::repository::Repository;
use crate::sentinel::{JobSentinel, SentinelTiming};

type SentinelTable = Arc<DashMap<JobId, Arc<JobSentinel>>>;

pub struct JobSentinelService {
    jobs: Arc<dyn Repository<MachineJob>>,
    devices: Arc<dyn Repository<Device>>,
    settings: Arc<dyn SettingsProvider>,
    capabilities: Arc<CapabilityRegistry>,
    notifications: NotificationChannel,
    findings: JobFailureChannel,
    alerts: Option<AlertService>,
    timing: SentinelTiming,
    sentinels: SentinelTable,
    /// Parent of every sentinel; cancelled on shutdown.
    shutdown: CancellationToken,
    subscriber_id: SubscriberId,
}

impl JobSentinelService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn Repository<MachineJob>>,
        devices: Arc<dyn Repository<Device>>,
        settings: Arc<dyn SettingsProvider>,
        capabilities: Arc<CapabilityRegistry>,
        notifications: NotificationChannel,
        findings: JobFailureChannel,
        alerts: Option<AlertService>,
        timing: SentinelTiming,
    ) -> Self {
        let subscriber_id = Uuid::new_v4();
        notifications.subscribe(subscriber_id);
        Self {
            jobs,
            devices,
            settings,
            capabilities,
            notifications,
            findings,
            alerts,
            timing,
            sentinels: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            subscriber_id,
        }
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self.sentinels.iter().map(|s| *s.key()).collect();
        jobs.sort_unstable();
        jobs
    }

    pub fn sentinel(&self, job_id: JobId) -> Option<Arc<JobSentinel>> {
        self.sentinels.get(&job_id).map(|s| Arc::clone(s.value()))
    }

    /// Create and start a sentinel for a job.
    ///
    /// # Returns
    ///
    /// `false` if the job already has a sentinel.
    ///
    /// # Errors
    ///
    /// * [`SentinelError::DeviceNotFound`] if the job's device is unknown
    /// * [`SentinelError::MissingCamera`] if the device has no camera URL
    /// * [`SentinelError::NoAnalyzer`] if no analyzer is registered
    /// * [`SentinelError::StartFailed`] if the analyzer cannot be built or started
    pub async fn start_sentinel(
        &self,
        job_id: JobId,
        device_id: DeviceId,
    ) -> Result<bool, SentinelError> {
        if self.sentinels.contains_key(&job_id) {
            return Ok(false);
        }

        let device = self
            .devices
            .get(device_id)
            .ok_or(SentinelError::DeviceNotFound { job_id, device_id })?;
        if device.camera_url().is_none() {
            return Err(SentinelError::MissingCamera { device_id });
        }

        let factory = self
            .capabilities
            .default_analyzer()
            .ok_or(SentinelError::NoAnalyzer)?;
        let analyzer = factory
            .create(&self.capabilities)
            .map_err(|e| SentinelError::StartFailed {
                job_id,
                source: e.into(),
            })?;

        let sentinel = Arc::new(JobSentinel::with_timing(
            job_id,
            device,
            analyzer,
            Arc::clone(&self.settings),
            self.findings.clone(),
            self.timing.clone(),
        ));

        match self.sentinels.entry(job_id) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&sentinel));
            }
        }

        if let Err(e) = sentinel.start_monitoring(&self.shutdown).await {
            self.sentinels
                .remove_if(&job_id, |_, s| Arc::ptr_eq(s, &sentinel));
            return Err(e);
        }

        tokio::spawn(supervise(
            Arc::clone(&sentinel),
            Arc::clone(&self.sentinels),
            self.alerts.clone(),
        ));
        Ok(true)
    }

    /// Stop and drop the sentinel of a job, if any.
    pub async fn stop_sentinel(&self, job_id: JobId) {
        let Some((_, sentinel)) = self.sentinels.remove(&job_id) else {
            return;
        };
        match sentinel.stop_monitoring().await {
            Ok(()) => info!("Stopped monitoring job {}", job_id),
            Err(e) => warn!("Monitoring of job {} had already failed: {}", job_id, e),
        }
    }

    /// Start sentinels for every active job, if AI monitoring is enabled.
    pub async fn start_active_jobs(&self) -> usize {
        if !self.settings.settings().enable_ai_monitoring {
            debug!("AI monitoring is disabled; not starting sentinels");
            return 0;
        }

        let mut started = 0;
        for job in self.jobs.get_all().into_iter().filter(MachineJob::is_active) {
            match self.start_sentinel(job.id, job.device_id).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => log_start_failure(job.id, &e),
            }
        }
        started
    }

    pub async fn stop_all(&self) {
        let jobs: Vec<JobId> = self.sentinels.iter().map(|s| *s.key()).collect();
        for job_id in jobs {
            self.stop_sentinel(job_id).await;
        }
    }

    /// React to job lifecycle and settings notifications until `cancel`
    /// fires or the channel closes, then stop every sentinel.
    pub async fn run(&self, cancel: CancellationToken) {
        let started = self.start_active_jobs().await;
        info!("Job sentinel service running; {} job(s) monitored", started);

        loop {
            let notification = match self.notifications.read(self.subscriber_id, &cancel).await {
                Ok(notification) => notification,
                Err(ChannelError::Cancelled) | Err(ChannelError::Closed) => break,
            };

            match notification {
                Notification::Job {
                    job_id,
                    device_id,
                    kind: JobNotificationKind::JobStarted,
                } => {
                    if !self.settings.settings().enable_ai_monitoring {
                        continue;
                    }
                    if let Err(e) = self.start_sentinel(job_id, device_id).await {
                        log_start_failure(job_id, &e);
                    }
                }
                Notification::Job {
                    job_id,
                    kind: JobNotificationKind::JobCompleted,
                    ..
                } => self.stop_sentinel(job_id).await,
                Notification::SettingsChanged => {
                    if self.settings.settings().enable_ai_monitoring {
                        self.start_active_jobs().await;
                    } else {
                        info!("AI monitoring disabled; stopping all sentinels");
                        self.stop_all().await;
                    }
                }
                Notification::Job { .. } | Notification::JobFailure { .. } => {}
            }
        }

        self.notifications.unsubscribe(self.subscriber_id);
        self.shutdown.cancel();
        self.stop_all().await;
        debug!("Job sentinel service stopped");
    }
}

fn log_start_failure(job_id: JobId, error: &SentinelError) {
    match error {
        SentinelError::MissingCamera { .. } => {
            info!("Not monitoring job {}: {}", job_id, error)
        }
        _ => error!("Failed to start monitoring job {}: {}", job_id, error),
    }
}

/// Await a sentinel's loop and drop it from the table when it ends on its own.
async fn supervise(sentinel: Arc<JobSentinel>, sentinels: SentinelTable, alerts: Option<AlertService>) {
    let job_id = sentinel.job_id();
    let outcome = sentinel.wait().await;
    sentinels.remove_if(&job_id, |_, s| Arc::ptr_eq(s, &sentinel));

    if let Err(e) = outcome {
        error!("Dropping sentinel for job {}: {}", job_id, e);
        if let Some(alerts) = alerts {
            if let Err(alert_error) = alerts
                .send_monitoring_offline_alert(job_id, &e.to_string())
                .await
            {
                error!("Failed to send monitoring offline alert: {}", alert_error);
            }
        }
    }
}
