// Integration tests for the sentinel service, failure responder and alerts.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    FakeDriverFactory, IdleAnalyzerFactory, Outcome, ScriptedAnalyzer, fake_capabilities,
    fake_device, fast_settings,
};
use overseer::alerts::AlertService;
use overseer::capabilities::{AnalyzerFactory, CapabilityRegistry};
use overseer::channel::Channels;
use overseer::config::{SettingsProvider, SharedSettings};
use overseer::control::ControlManager;
use overseer::detector::FailureAnalyzer;
use overseer::error::{ProviderError, SentinelError};
use overseer::model::{
    Device, DeviceState, FailureAction, JobFailureFinding, JobNotificationKind, MachineJob,
    Notification,
};
use overseer::providers::DeviceProviderRegistry;
use overseer::repository::{MemoryRepository, Repository};
use overseer::responder::JobFailureService;
use overseer::sentinel::SentinelTiming;
use overseer::sentinel_service::JobSentinelService;

// ── Helpers ─────────────────────────────────────────────────────────

struct BrokenCameraFactory;

impl AnalyzerFactory for BrokenCameraFactory {
    fn create(&self, _capabilities: &CapabilityRegistry) -> anyhow::Result<Arc<dyn FailureAnalyzer>> {
        Ok(ScriptedAnalyzer::always(Outcome::Error("camera offline")))
    }
}

fn job(id: i64, device_id: i64, finished: bool) -> MachineJob {
    MachineJob {
        id,
        device_id,
        start_time: Some(Utc::now()),
        end_time: finished.then(Utc::now),
        state: DeviceState::Printing,
    }
}

fn finding(device_id: i64) -> JobFailureFinding {
    JobFailureFinding {
        job_id: 11,
        device_id,
        reason: "spaghetti".to_string(),
        confidence: 0.92,
        details: String::new(),
        failure_ratio: 0.8,
        detected_at: Utc::now(),
    }
}

struct SentinelHarness {
    service: Arc<JobSentinelService>,
    settings: SharedSettings,
    channels: Channels,
    jobs: Arc<dyn Repository<MachineJob>>,
}

fn sentinel_harness(
    analyzer: Option<Box<dyn FnOnce(&mut CapabilityRegistry)>>,
    alerts: Option<AlertService>,
    timing: SentinelTiming,
) -> SentinelHarness {
    let mut no_camera = fake_device(2, "Bambu");
    no_camera.snapshot_url = None;
    let devices: Arc<dyn Repository<Device>> =
        Arc::new(MemoryRepository::with_items([fake_device(1, "Voron"), no_camera]));
    let jobs: Arc<dyn Repository<MachineJob>> = Arc::new(MemoryRepository::new());

    let mut capabilities = CapabilityRegistry::new();
    if let Some(register) = analyzer {
        register(&mut capabilities);
    }

    let settings = fast_settings(FailureAction::PauseJob);
    let channels = Channels::new();
    let service = Arc::new(JobSentinelService::new(
        Arc::clone(&jobs),
        devices,
        Arc::new(settings.clone()),
        Arc::new(capabilities),
        channels.notifications.clone(),
        channels.job_failures.clone(),
        alerts,
        timing,
    ));
    SentinelHarness {
        service,
        settings,
        channels,
        jobs,
    }
}

fn idle_analyzer() -> Option<Box<dyn FnOnce(&mut CapabilityRegistry)>> {
    Some(Box::new(|registry: &mut CapabilityRegistry| {
        registry.register_analyzer("idle", IdleAnalyzerFactory)
    }))
}

fn spawn_run(service: &Arc<JobSentinelService>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let service = Arc::clone(service);
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });
    (cancel, task)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn job_notification(job_id: i64, device_id: i64, kind: JobNotificationKind) -> Notification {
    Notification::Job {
        job_id,
        device_id,
        kind,
    }
}

// ── Sentinel service ────────────────────────────────────────────────

#[tokio::test]
async fn job_lifecycle_starts_and_stops_sentinels() {
    let h = sentinel_harness(idle_analyzer(), None, SentinelTiming::default());
    let (cancel, task) = spawn_run(&h.service);

    h.channels
        .notifications
        .publish(job_notification(10, 1, JobNotificationKind::JobStarted));
    let service = Arc::clone(&h.service);
    eventually(|| service.active_jobs() == vec![10]).await;

    let sentinel = h.service.sentinel(10).unwrap();
    h.channels
        .notifications
        .publish(job_notification(10, 1, JobNotificationKind::JobCompleted));
    eventually(|| service.active_jobs().is_empty()).await;
    assert_eq!(sentinel.state(), overseer::SentinelState::Stopped);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn job_started_is_ignored_while_monitoring_is_disabled() {
    let h = sentinel_harness(idle_analyzer(), None, SentinelTiming::default());
    h.settings.update(|s| s.enable_ai_monitoring = false);
    h.jobs.save(job(10, 1, false));
    let (cancel, task) = spawn_run(&h.service);

    h.channels
        .notifications
        .publish(job_notification(10, 1, JobNotificationKind::JobStarted));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.service.active_jobs().is_empty());

    h.settings.update(|s| s.enable_ai_monitoring = true);
    h.channels.notifications.publish(Notification::SettingsChanged);
    let service = Arc::clone(&h.service);
    eventually(|| service.active_jobs() == vec![10]).await;

    h.settings.update(|s| s.enable_ai_monitoring = false);
    h.channels.notifications.publish(Notification::SettingsChanged);
    eventually(|| service.active_jobs().is_empty()).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn start_active_jobs_skips_finished_and_cameraless_jobs() {
    let h = sentinel_harness(idle_analyzer(), None, SentinelTiming::default());
    h.jobs.save(job(10, 1, false));
    h.jobs.save(job(11, 1, true));
    h.jobs.save(job(12, 2, false));

    assert_eq!(h.service.start_active_jobs().await, 1);
    assert_eq!(h.service.active_jobs(), vec![10]);

    // Already running.
    assert_eq!(h.service.start_active_jobs().await, 0);
    h.service.stop_all().await;
    assert!(h.service.active_jobs().is_empty());
}

#[tokio::test]
async fn start_sentinel_reports_each_precondition() {
    let h = sentinel_harness(idle_analyzer(), None, SentinelTiming::default());

    assert!(matches!(
        h.service.start_sentinel(10, 99).await,
        Err(SentinelError::DeviceNotFound { job_id: 10, device_id: 99 })
    ));
    assert!(matches!(
        h.service.start_sentinel(10, 2).await,
        Err(SentinelError::MissingCamera { device_id: 2 })
    ));
    assert!(h.service.start_sentinel(10, 1).await.unwrap());
    assert!(!h.service.start_sentinel(10, 1).await.unwrap());
    h.service.stop_all().await;

    let bare = sentinel_harness(None, None, SentinelTiming::default());
    assert!(matches!(
        bare.service.start_sentinel(10, 1).await,
        Err(SentinelError::NoAnalyzer)
    ));
}

#[tokio::test]
async fn faulted_sentinel_is_dropped_and_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let timing = SentinelTiming {
        initial_backoff: Duration::from_millis(10),
        ..SentinelTiming::default()
    };
    let h = sentinel_harness(
        Some(Box::new(|registry: &mut CapabilityRegistry| {
            registry.register_analyzer("broken", BrokenCameraFactory)
        })),
        Some(AlertService::new(format!("{}/webhook", server.uri()))),
        timing,
    );

    assert!(h.service.start_sentinel(10, 1).await.unwrap());
    let sentinel = h.service.sentinel(10).unwrap();

    let service = Arc::clone(&h.service);
    eventually(|| service.active_jobs().is_empty()).await;
    assert_eq!(sentinel.state(), overseer::SentinelState::Faulted);

    // Give the supervisor time to deliver the alert.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn shutdown_stops_every_sentinel() {
    let h = sentinel_harness(idle_analyzer(), None, SentinelTiming::default());
    h.jobs.save(job(10, 1, false));
    let (cancel, task) = spawn_run(&h.service);

    let service = Arc::clone(&h.service);
    eventually(|| service.active_jobs() == vec![10]).await;
    let sentinel = h.service.sentinel(10).unwrap();

    cancel.cancel();
    task.await.unwrap();

    assert!(h.service.active_jobs().is_empty());
    assert_eq!(sentinel.state(), overseer::SentinelState::Stopped);
    assert_eq!(h.channels.notifications.subscriber_count(), 0);
}

// ── Failure responder ───────────────────────────────────────────────

struct Responder {
    service: JobFailureService,
    factory: FakeDriverFactory,
    settings: SharedSettings,
    channels: Channels,
}

fn responder(alerts: Option<AlertService>) -> Responder {
    let devices: Arc<dyn Repository<Device>> =
        Arc::new(MemoryRepository::with_items([fake_device(1, "Voron")]));
    let factory = FakeDriverFactory::default();
    let providers = Arc::new(DeviceProviderRegistry::new(Arc::new(fake_capabilities(
        factory.clone(),
    ))));
    let control = Arc::new(ControlManager::new(devices, providers));
    let settings = fast_settings(FailureAction::PauseJob);
    let channels = Channels::new();
    let provider: Arc<dyn SettingsProvider> = Arc::new(settings.clone());
    let service = JobFailureService::new(
        control,
        provider,
        channels.job_failures.clone(),
        channels.notifications.clone(),
        alerts,
    );
    Responder {
        service,
        factory,
        settings,
        channels,
    }
}

#[tokio::test]
async fn pause_action_pauses_the_device_and_notifies() {
    let r = responder(None);
    let reader = Uuid::new_v4();
    r.channels.notifications.subscribe(reader);

    let action = r.service.handle_finding(finding(1)).await;

    assert_eq!(action, FailureAction::PauseJob);
    let driver = r.factory.driver_for(1).unwrap();
    assert_eq!(driver.pauses.load(Ordering::SeqCst), 1);
    match r.channels.notifications.try_read(reader).unwrap() {
        Some(Notification::JobFailure { finding, action }) => {
            assert_eq!(finding.reason, "spaghetti");
            assert_eq!(action, FailureAction::PauseJob);
        }
        other => panic!("expected a job failure notification, got {:?}", other),
    }
}

#[tokio::test]
async fn cancel_and_alert_only_actions() {
    let r = responder(None);

    r.settings.update(|s| s.failure_action = FailureAction::CancelJob);
    r.service.handle_finding(finding(1)).await;
    let driver = r.factory.driver_for(1).unwrap();
    assert_eq!(driver.cancels.load(Ordering::SeqCst), 1);

    r.settings.update(|s| s.failure_action = FailureAction::AlertOnly);
    r.service.handle_finding(finding(1)).await;
    assert_eq!(driver.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(driver.pauses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_device_still_notifies() {
    let r = responder(None);
    let reader = Uuid::new_v4();
    r.channels.notifications.subscribe(reader);

    r.service.handle_finding(finding(42)).await;

    assert!(r.channels.notifications.try_read(reader).unwrap().is_some());
    assert_eq!(r.factory.created_count(), 0);
}

#[tokio::test]
async fn findings_from_the_channel_are_handled_and_alerted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let r = responder(Some(AlertService::new(format!("{}/webhook", server.uri()))));
    let service = Arc::new(r.service);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    r.channels.job_failures.publish(finding(1));
    let factory = r.factory.clone();
    eventually(|| {
        factory
            .driver_for(1)
            .is_some_and(|d| d.pauses.load(Ordering::SeqCst) == 1)
    })
    .await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn control_rejects_unknown_devices() {
    let devices: Arc<dyn Repository<Device>> = Arc::new(MemoryRepository::new());
    let providers = Arc::new(DeviceProviderRegistry::new(Arc::new(CapabilityRegistry::new())));
    let control = ControlManager::new(devices, providers);

    assert!(matches!(
        control.resume_job(3).await,
        Err(ProviderError::DeviceNotFound { device_id: 3 })
    ));
}

// ── Alerts ──────────────────────────────────────────────────────────

#[tokio::test]
async fn alert_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let alerts = AlertService::new(format!("{}/webhook", server.uri()));
    let err = alerts
        .send_job_failure_alert(&finding(1), FailureAction::PauseJob)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Failed to send Discord alert"));
}
