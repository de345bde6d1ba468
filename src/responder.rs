use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alerts::AlertService;
use crate::channel::{JobFailureChannel, NotificationChannel, SubscriberId};
use crate::config::SettingsProvider;
use crate::control::ControlManager;
use crate::error::ChannelError;
use crate::model::{FailureAction, JobFailureFinding, Notification};

/// Applies the configured failure action to every finding and tells users about it.
pub struct JobFailureService {
    control: Arc<ControlManager>,
    settings: Arc<dyn SettingsProvider>,
    findings: JobFailureChannel,
    notifications: NotificationChannel,
    alerts: Option<AlertService>,
    subscriber_id: SubscriberId,
}

impl JobFailureService {
    pub fn new(
        control: Arc<ControlManager>,
        settings: Arc<dyn SettingsProvider>,
        findings: JobFailureChannel,
        notifications: NotificationChannel,
        alerts: Option<AlertService>,
    ) -> Self {
        let subscriber_id = Uuid::new_v4();
        findings.subscribe(subscriber_id);
        Self {
            control,
            settings,
            findings,
            notifications,
            alerts,
            subscriber_id,
        }
    }

    /// Handle one finding.
    ///
    /// A failing pause or cancel is logged; the notification and alert are
    /// still sent so a user can step in.
    pub async fn handle_finding(&self, finding: JobFailureFinding) -> FailureAction {
        let action = self.settings.settings().failure_action;
        let applied = match action {
            FailureAction::AlertOnly => Ok(()),
            FailureAction::PauseJob => self.control.pause_job(finding.device_id).await,
            FailureAction::CancelJob => self.control.cancel_job(finding.device_id).await,
        };
        match applied {
            Ok(()) => info!(
                "Job {} failure '{}' handled with {:?}",
                finding.job_id, finding.reason, action
            ),
            Err(e) => error!(
                "Failed to apply {:?} to job {} on device {}: {}",
                action, finding.job_id, finding.device_id, e
            ),
        }

        if let Some(alerts) = &self.alerts {
            if let Err(e) = alerts.send_job_failure_alert(&finding, action).await {
                error!("Failed to send Discord job failure alert: {}", e);
            }
        }

        self.notifications
            .publish(Notification::JobFailure { finding, action });
        action
    }

    /// Process findings until `cancel` fires or the channel closes.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.findings.read(self.subscriber_id, &cancel).await {
                Ok(finding) => {
                    self.handle_finding(finding).await;
                }
                Err(ChannelError::Cancelled) | Err(ChannelError::Closed) => break,
            }
        }
        self.findings.unsubscribe(self.subscriber_id);
    }
}
