// Shared fakes for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use overseer::capabilities::{
    AnalyzerFactory, CapabilityRegistry, DeviceConfigurator, DeviceTypeRegistration,
    DriverFactory,
};
use overseer::config::{ApplicationSettings, SharedSettings};
use overseer::detector::FailureAnalyzer;
use overseer::model::{Device, DeviceId, DeviceState, DeviceStatus, FailureAction, FieldDescriptor, Verdict};
use overseer::providers::DeviceDriver;

pub const FAKE_TYPE: &str = "Fake";

// ── Drivers ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDriver {
    pub device_id: DeviceId,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub cancels: AtomicUsize,
    pub intervals: Mutex<Vec<Duration>>,
}

impl FakeDriver {
    /// Poll interval passed to the most recent `start`.
    pub fn last_interval(&self) -> Option<Duration> {
        self.intervals.lock().unwrap().last().copied()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceDriver for FakeDriver {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    async fn start(
        &self,
        interval: Duration,
        device: &Device,
        sink: mpsc::Sender<DeviceStatus>,
    ) -> anyhow::Result<()> {
        self.intervals.lock().unwrap().push(interval);
        self.starts.fetch_add(1, Ordering::SeqCst);
        let _ = sink.try_send(DeviceStatus::new(device.id, DeviceState::Idle));
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn pause_job(&self) -> anyhow::Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_job(&self) -> anyhow::Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel_job(&self) -> anyhow::Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts instantiations and keeps every driver it built.
#[derive(Clone, Default)]
pub struct FakeDriverFactory {
    pub created: Arc<Mutex<Vec<Arc<FakeDriver>>>>,
}

impl FakeDriverFactory {
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn driver_for(&self, device_id: DeviceId) -> Option<Arc<FakeDriver>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned()
    }
}

impl DriverFactory for FakeDriverFactory {
    fn create(&self, device: &Device) -> anyhow::Result<Arc<dyn DeviceDriver>> {
        let driver = Arc::new(FakeDriver {
            device_id: device.id,
            ..Default::default()
        });
        self.created.lock().unwrap().push(Arc::clone(&driver));
        Ok(driver)
    }
}

/// Marks devices as configured through a property.
pub struct FakeConfigurator;

#[async_trait]
impl DeviceConfigurator for FakeConfigurator {
    async fn configure(&self, mut device: Device) -> anyhow::Result<Device> {
        device
            .properties
            .insert("configured".to_string(), serde_json::Value::Bool(true));
        Ok(device)
    }
}

/// Registry with one `Fake` device type backed by `factory`.
pub fn fake_capabilities(factory: FakeDriverFactory) -> CapabilityRegistry {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register_device_type(
        DeviceTypeRegistration::new(FAKE_TYPE)
            .field(FieldDescriptor::new("url", "URL").required())
            .field(FieldDescriptor::new("internal", "Internal").ignored())
            .driver(factory)
            .configurator(FakeConfigurator),
    );
    capabilities
}

pub fn fake_device(id: DeviceId, name: &str) -> Device {
    let mut device = Device::new(id, FAKE_TYPE, name);
    device.snapshot_url = Some(format!("http://camera.invalid/{}/snapshot", id));
    device
}

// ── Analyzers ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Outcome {
    Verdict(Verdict),
    Nothing,
    Error(&'static str),
}

pub fn fail(reason: &str) -> Outcome {
    Outcome::Verdict(Verdict::failure(reason, 0.9))
}

pub fn ok() -> Outcome {
    Outcome::Verdict(Verdict::success(0.95))
}

/// Replays a script of outcomes. Without `cycle`, the last outcome repeats forever.
pub struct ScriptedAnalyzer {
    script: Vec<Outcome>,
    cycle: bool,
    pub calls: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new(script: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script,
            cycle: false,
            calls: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn cycling(script: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script,
            cycle: true,
            calls: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn always(outcome: Outcome) -> Arc<Self> {
        Self::new(vec![outcome])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FailureAnalyzer for ScriptedAnalyzer {
    async fn start(&self, _device: &Device) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn analyze(&self) -> anyhow::Result<Option<Verdict>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = if self.cycle {
            call % self.script.len()
        } else {
            call.min(self.script.len() - 1)
        };
        match &self.script[index] {
            Outcome::Verdict(verdict) => Ok(Some(verdict.clone())),
            Outcome::Nothing => Ok(None),
            Outcome::Error(message) => Err(anyhow::anyhow!(*message)),
        }
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out analyzers that never produce a verdict.
pub struct IdleAnalyzerFactory;

impl AnalyzerFactory for IdleAnalyzerFactory {
    fn create(&self, _capabilities: &CapabilityRegistry) -> anyhow::Result<Arc<dyn FailureAnalyzer>> {
        Ok(ScriptedAnalyzer::always(Outcome::Nothing))
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// 10 frames per second so a full window takes two seconds.
pub fn fast_settings(action: FailureAction) -> SharedSettings {
    SharedSettings::new(ApplicationSettings {
        poll_interval: Duration::from_millis(100),
        enable_ai_monitoring: true,
        frame_capture_rate: 10.0,
        failure_action: action,
    })
}
