// Integration tests for the job sentinel and its consensus window.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{Outcome, ScriptedAnalyzer, fail, fake_device, fast_settings, ok};
use overseer::channel::JobFailureChannel;
use overseer::config::SettingsProvider;
use overseer::error::SentinelError;
use overseer::model::{FailureAction, JobFailureFinding, Verdict};
use overseer::sentinel::{ConsensusWindow, JobSentinel, SentinelState};

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    sentinel: JobSentinel,
    analyzer: Arc<ScriptedAnalyzer>,
    findings: JobFailureChannel,
    reader: Uuid,
}

impl Harness {
    fn drain(&self) -> Vec<JobFailureFinding> {
        let mut out = Vec::new();
        while let Ok(Some(finding)) = self.findings.try_read(self.reader) {
            out.push(finding);
        }
        out
    }
}

fn harness(analyzer: Arc<ScriptedAnalyzer>, action: FailureAction) -> Harness {
    let findings = JobFailureChannel::new("job-failures");
    let reader = Uuid::new_v4();
    findings.subscribe(reader);

    let settings: Arc<dyn SettingsProvider> = Arc::new(fast_settings(action));
    let sentinel = JobSentinel::new(
        7,
        fake_device(1, "Voron"),
        analyzer.clone(),
        settings,
        findings.clone(),
    );
    Harness {
        sentinel,
        analyzer,
        findings,
        reader,
    }
}

fn script(failures: usize, successes: usize) -> Vec<Outcome> {
    let mut script: Vec<Outcome> = Vec::new();
    script.extend((0..successes).map(|_| ok()));
    script.extend((0..failures).map(|_| fail("spaghetti")));
    script.push(Outcome::Nothing);
    script
}

// ── Consensus window ────────────────────────────────────────────────

#[test]
fn window_needs_to_be_full() {
    let mut window = ConsensusWindow::new(20, 0.7);
    for _ in 0..19 {
        window.push(Verdict::failure("spaghetti", 0.9));
    }
    assert!(!window.is_full());
    assert_eq!(window.evaluate(), None);

    window.push(Verdict::failure("spaghetti", 0.9));
    assert!(window.is_full());
    assert!(window.evaluate().is_some());
}

#[test]
fn window_threshold_is_inclusive() {
    let mut at_threshold = ConsensusWindow::new(20, 0.7);
    for i in 0..20 {
        at_threshold.push(if i < 14 {
            Verdict::failure("spaghetti", 0.9)
        } else {
            Verdict::success(0.9)
        });
    }
    let consensus = at_threshold.evaluate().expect("14 of 20 reaches consensus");
    assert_eq!(consensus.reason, "spaghetti");
    assert!((consensus.failure_ratio - 0.7).abs() < 1e-9);

    let mut below = ConsensusWindow::new(20, 0.7);
    for i in 0..20 {
        below.push(if i < 13 {
            Verdict::failure("spaghetti", 0.9)
        } else {
            Verdict::success(0.9)
        });
    }
    assert_eq!(below.evaluate(), None);
}

#[test]
fn window_tie_goes_to_reason_seen_first() {
    let mut window = ConsensusWindow::new(20, 0.7);
    let mut first_shift = Verdict::failure("layer_shift", 0.55);
    first_shift.details = "first".to_string();
    window.push(first_shift);
    window.push(Verdict::failure("spaghetti", 0.9));
    for _ in 0..6 {
        window.push(Verdict::failure("layer_shift", 0.8));
        window.push(Verdict::failure("spaghetti", 0.9));
    }
    for _ in 0..6 {
        window.push(Verdict::success(0.9));
    }

    let consensus = window.evaluate().expect("14 failures of 20");
    assert_eq!(consensus.reason, "layer_shift");
    assert!((consensus.confidence - 0.55).abs() < 1e-9);
    assert_eq!(consensus.details, "first");
}

/// Fills a window from a 10-frame pattern repeated twice; `S` marks a success.
fn interleaved_window(pattern: &str) -> ConsensusWindow {
    let mut window = ConsensusWindow::new(20, 0.7);
    for frame in pattern.chars().cycle().take(20) {
        window.push(if frame == 'S' {
            Verdict::success(0.9)
        } else {
            Verdict::failure("spaghetti", 0.9)
        });
    }
    window
}

#[test]
fn window_counts_failures_across_interleaved_successes() {
    // Never more than two failures in a row, still 14 of 20.
    let window = interleaved_window("FSFFSFFSFF");
    let consensus = window.evaluate().expect("14 interleaved failures of 20");
    assert!((consensus.failure_ratio - 0.7).abs() < 1e-9);

    // 12 of 20, with the same longest failure run.
    let window = interleaved_window("FSFFSFSFFS");
    assert!((window.failure_ratio() - 0.6).abs() < 1e-9);
    assert_eq!(window.evaluate(), None);
}

#[test]
fn window_evicts_oldest() {
    let mut window = ConsensusWindow::new(3, 0.7);
    window.push(Verdict::success(0.9));
    window.push(Verdict::failure("spaghetti", 0.9));
    window.push(Verdict::failure("spaghetti", 0.9));
    assert_eq!(window.evaluate(), None);

    window.push(Verdict::failure("spaghetti", 0.9));
    assert_eq!(window.len(), 3);
    assert!((window.failure_ratio() - 1.0).abs() < 1e-9);
    assert!(window.evaluate().is_some());
}

// ── Monitoring loop ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fourteen_failures_of_twenty_publish_one_finding() {
    let h = harness(ScriptedAnalyzer::new(script(14, 6)), FailureAction::AlertOnly);
    h.sentinel
        .start_monitoring(&CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let findings = h.drain();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].job_id, 7);
    assert_eq!(findings[0].device_id, 1);
    assert_eq!(findings[0].reason, "spaghetti");
    h.sentinel.stop_monitoring().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn thirteen_failures_of_twenty_publish_nothing() {
    let h = harness(ScriptedAnalyzer::new(script(13, 7)), FailureAction::AlertOnly);
    h.sentinel
        .start_monitoring(&CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(h.drain().is_empty());
    assert_eq!(h.sentinel.state(), SentinelState::Monitoring);
    h.sentinel.stop_monitoring().await.unwrap();
    assert_eq!(h.sentinel.state(), SentinelState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn interleaved_failures_reach_consensus() {
    let pattern = "FSFFSFFSFF"
        .chars()
        .map(|frame| if frame == 'S' { ok() } else { fail("spaghetti") })
        .collect();
    let h = harness(ScriptedAnalyzer::cycling(pattern), FailureAction::CancelJob);
    h.sentinel
        .start_monitoring(&CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.drain().len(), 1);
    assert_eq!(h.analyzer.calls(), 20);
    assert_eq!(h.sentinel.state(), SentinelState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn cooldown_follows_a_finding_when_pausing() {
    let h = harness(ScriptedAnalyzer::always(fail("spaghetti")), FailureAction::PauseJob);
    h.sentinel
        .start_monitoring(&CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.drain().len(), 1);
    // No frames are sampled during the cooldown.
    assert_eq!(h.analyzer.calls(), 20);

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(h.drain().len(), 1);
    assert_eq!(h.sentinel.state(), SentinelState::Monitoring);

    h.sentinel.stop_monitoring().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancel_action_ends_monitoring_after_finding() {
    let h = harness(ScriptedAnalyzer::always(fail("spaghetti")), FailureAction::CancelJob);
    h.sentinel
        .start_monitoring(&CancellationToken::new())
        .await
        .unwrap();

    h.sentinel.wait().await.unwrap();

    assert_eq!(h.drain().len(), 1);
    assert_eq!(h.analyzer.calls(), 20);
    assert_eq!(h.sentinel.state(), SentinelState::Stopped);
    assert!(h.analyzer.stops.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn three_consecutive_errors_fault_the_sentinel() {
    let h = harness(
        ScriptedAnalyzer::always(Outcome::Error("camera unreachable")),
        FailureAction::PauseJob,
    );
    h.sentinel
        .start_monitoring(&CancellationToken::new())
        .await
        .unwrap();

    let outcome = h.sentinel.wait().await;

    match outcome {
        Err(SentinelError::Faulted { job_id, failures, .. }) => {
            assert_eq!(job_id, 7);
            assert_eq!(failures, 3);
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(h.analyzer.calls(), 3);
    assert_eq!(h.sentinel.state(), SentinelState::Faulted);
    assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn success_resets_the_error_count() {
    let h = harness(
        ScriptedAnalyzer::cycling(vec![
            Outcome::Error("timeout"),
            Outcome::Error("timeout"),
            ok(),
        ]),
        FailureAction::PauseJob,
    );
    h.sentinel
        .start_monitoring(&CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(400)).await;

    assert!(h.analyzer.calls() >= 9);
    assert_eq!(h.sentinel.state(), SentinelState::Monitoring);
    h.sentinel.stop_monitoring().await.unwrap();
    assert_eq!(h.sentinel.state(), SentinelState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn external_cancellation_stops_the_loop() {
    let h = harness(ScriptedAnalyzer::always(Outcome::Nothing), FailureAction::PauseJob);
    let shutdown = CancellationToken::new();
    h.sentinel.start_monitoring(&shutdown).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    h.sentinel.wait().await.unwrap();

    assert_eq!(h.sentinel.state(), SentinelState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn start_is_ignored_unless_idle() {
    let h = harness(ScriptedAnalyzer::always(Outcome::Nothing), FailureAction::PauseJob);
    let token = CancellationToken::new();
    h.sentinel.start_monitoring(&token).await.unwrap();
    h.sentinel.start_monitoring(&token).await.unwrap();

    assert_eq!(h.analyzer.starts.load(std::sync::atomic::Ordering::SeqCst), 1);
    h.sentinel.stop_monitoring().await.unwrap();
}
