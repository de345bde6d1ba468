use anyhow::Result;
use serde_json::json;

use crate::model::{FailureAction, JobFailureFinding, JobId};

/// Discord alert service for sending rich embed notifications.
///
/// Sends formatted Discord alerts about job failures detected by the
/// sentinels and about sentinels that had to give up.
#[derive(Clone)]
pub struct AlertService {
    client: reqwest::Client,
    webhook_url: String,
}

impl AlertService {
    /// Create a new AlertService with the provided Discord webhook URL.
    ///
    /// # Arguments
    ///
    /// * `webhook_url` - A valid Discord webhook URL
    ///
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    /// Send a Discord alert with rich embed formatting.
    ///
    /// # Arguments
    ///
    /// * `title` - The title of the alert
    /// * `description` - The main content of the alert (supports Markdown)
    /// * `color` - The color of the embed sidebar (as a hex value, e.g., 0xFF0000 for red)
    /// * `emoji` - An emoji to display with the title
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails
    /// - The Discord API returns an error status
    ///
    pub async fn send_alert(
        &self,
        title: &str,
        description: &str,
        color: u32,
        emoji: &str,
    ) -> Result<()> {
        let timestamp = chrono::Utc::now().to_rfc3339();

        let embed = json!({
            "embeds": [{
                "title": format!("{} {}", emoji, title),
                "description": description,
                "color": color,
                "timestamp": timestamp,
                "footer": {
                    "text": "Overseer"
                }
            }]
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&embed)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to send Discord alert: HTTP {}",
                response.status()
            ));
        }

        Ok(())
    }

    /// Send a job failure alert describing the finding and what was done about it.
    pub async fn send_job_failure_alert(
        &self,
        finding: &JobFailureFinding,
        action: FailureAction,
    ) -> Result<()> {
        let outcome = match action {
            FailureAction::AlertOnly => "The job keeps running.",
            FailureAction::PauseJob => "The job has been **paused**. Please check the printer.",
            FailureAction::CancelJob => "The job has been **cancelled**.",
        };
        let description = format!(
            "Detected **{}** on job {} (device {}) with **{:.2}%** confidence.\n\
             {:.0}% of recent frames looked wrong.\n\n{}",
            finding.reason,
            finding.job_id,
            finding.device_id,
            finding.confidence * 100.0,
            finding.failure_ratio * 100.0,
            outcome
        );

        let (color, emoji) = match action {
            FailureAction::AlertOnly => (0xFFA500, "⚠️"), // Orange
            FailureAction::PauseJob | FailureAction::CancelJob => (0xFF0000, "🚨"), // Red
        };
        self.send_alert("Print Failure Detected", &description, color, emoji)
            .await
    }

    /// Send an alert that AI monitoring of a job stopped after repeated errors.
    pub async fn send_monitoring_offline_alert(&self, job_id: JobId, reason: &str) -> Result<()> {
        let description = format!(
            "Monitoring of job {} stopped after repeated errors: {}. The job is no longer watched!",
            job_id, reason
        );

        self.send_alert(
            "CRITICAL: Job Monitoring Offline",
            &description,
            0xFF0000, // Red color
            "🚨",
        )
        .await
    }
}
