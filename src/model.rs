//! Shared data types flowing between drivers, channels and sentinels.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DeviceId = i64;
pub type JobId = i64;

/// A monitored device as supplied by the device repository.
///
/// Well-known fields are typed; everything a driver needs beyond them
/// (API keys, host names, serial numbers...) lives in `properties`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,

    /// Declared type name, resolved to a driver through the capability registry.
    pub device_type: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub webcam_url: Option<String>,

    #[serde(default)]
    pub snapshot_url: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub sort_index: i32,

    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    /// Heaters and extruders discovered from the device itself.
    #[serde(default)]
    pub tools: Vec<Tool>,
}

impl Device {
    pub fn new(id: DeviceId, device_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            device_type: device_type.into(),
            name: name.into(),
            webcam_url: None,
            snapshot_url: None,
            disabled: false,
            sort_index: 0,
            properties: BTreeMap::new(),
            tools: Vec::new(),
        }
    }

    /// Get a string property from the property bag.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// The URL used to sample still frames: the snapshot URL when present,
    /// otherwise the webcam URL.
    pub fn camera_url(&self) -> Option<&str> {
        self.snapshot_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| self.webcam_url.as_deref().filter(|u| !u.is_empty()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolKind {
    Heater,
    Extruder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub kind: ToolKind,
    pub index: u32,
    pub name: String,
}

/// Where a configuration field is shown when rendering device forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayType {
    CreateOnly,
    UpdateOnly,
    Both,
}

/// Metadata for one configurable field of a device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub property_name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub display_type: DisplayType,
    pub is_required: bool,
    pub is_sensitive: bool,
    pub is_ignored: bool,
}

impl FieldDescriptor {
    pub fn new(property_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            property_name: property_name.into(),
            display_name: Some(display_name.into()),
            description: None,
            display_type: DisplayType::Both,
            is_required: false,
            is_sensitive: false,
            is_ignored: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn display_type(mut self, display_type: DisplayType) -> Self {
        self.display_type = display_type;
        self
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.is_sensitive = true;
        self
    }

    pub fn ignored(mut self) -> Self {
        self.is_ignored = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceState {
    Offline,
    Idle,
    Operational,
    Paused,
    Printing,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Offline => "offline",
            DeviceState::Idle => "idle",
            DeviceState::Operational => "operational",
            DeviceState::Paused => "paused",
            DeviceState::Printing => "printing",
            DeviceState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub file_name: Option<String>,
    /// 0.0 to 100.0
    pub percent_complete: f64,
    pub elapsed_seconds: u64,
    pub estimated_remaining_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Temperature {
    pub actual: f64,
    pub target: f64,
}

/// One status sample emitted by a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub state: DeviceState,
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub temperatures: BTreeMap<String, Temperature>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn new(device_id: DeviceId, state: DeviceState) -> Self {
        Self {
            device_id,
            state,
            progress: None,
            temperatures: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// A print job tracked by the external lifecycle collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineJob {
    pub id: JobId,
    pub device_id: DeviceId,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: DeviceState,
}

impl MachineJob {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Result of analyzing a single camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_failure: bool,
    /// 0.0 to 1.0
    pub confidence: f64,
    /// Specific failure label, or "None" for successful frames.
    pub reason: String,
    pub details: String,
}

impl Verdict {
    pub fn success(confidence: f64) -> Self {
        Self {
            is_failure: false,
            confidence,
            reason: "None".to_string(),
            details: String::new(),
        }
    }

    pub fn failure(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            is_failure: true,
            confidence,
            reason: reason.into(),
            details: String::new(),
        }
    }
}

/// Consensus failure finding published on the job-failure channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailureFinding {
    pub job_id: JobId,
    pub device_id: DeviceId,
    pub reason: String,
    pub confidence: f64,
    pub details: String,
    /// Fraction of failing verdicts in the window that triggered the finding.
    pub failure_ratio: f64,
    pub detected_at: DateTime<Utc>,
}

/// What to do when a sentinel reports a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureAction {
    AlertOnly,
    PauseJob,
    CancelJob,
}

impl std::str::FromStr for FailureAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "alert" | "alertonly" => Ok(FailureAction::AlertOnly),
            "pause" | "pausejob" => Ok(FailureAction::PauseJob),
            "cancel" | "canceljob" => Ok(FailureAction::CancelJob),
            other => Err(format!("unknown failure action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobNotificationKind {
    JobStarted,
    JobPaused,
    JobResumed,
    JobCompleted,
}

/// User-facing notifications, also used as job lifecycle signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    Job {
        job_id: JobId,
        device_id: DeviceId,
        kind: JobNotificationKind,
    },
    JobFailure {
        finding: JobFailureFinding,
        action: FailureAction,
    },
    /// Sent when AI monitoring is toggled so the sentinel service re-reads settings.
    SettingsChanged,
}

/// Signal that the set or configuration of devices changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyChanged;
