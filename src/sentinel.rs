//! Per-job failure monitoring.
//!
//! A [`JobSentinel`] samples the analyzer at the configured frame rate,
//! keeps the most recent verdicts in a [`ConsensusWindow`] and publishes a
//! [`JobFailureFinding`] once enough of them agree the job is failing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::JobFailureChannel;
use crate::config::{SettingsProvider, constants};
use crate::detector::FailureAnalyzer;
use crate::error::SentinelError;
use crate::model::{Device, DeviceId, FailureAction, JobFailureFinding, JobId, Verdict};

/// Agreement reached by a full window.
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub reason: String,
    pub confidence: f64,
    pub details: String,
    pub failure_ratio: f64,
}

/// Bounded FIFO of the most recent verdicts.
#[derive(Debug, Clone)]
pub struct ConsensusWindow {
    capacity: usize,
    threshold: f64,
    verdicts: VecDeque<Verdict>,
}

impl ConsensusWindow {
    pub fn new(capacity: usize, threshold: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            threshold,
            verdicts: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a verdict, evicting the oldest when full.
    pub fn push(&mut self, verdict: Verdict) {
        if self.verdicts.len() == self.capacity {
            self.verdicts.pop_front();
        }
        self.verdicts.push_back(verdict);
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.verdicts.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.verdicts.clear();
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.verdicts.is_empty() {
            return 0.0;
        }
        let failures = self.verdicts.iter().filter(|v| v.is_failure).count();
        failures as f64 / self.verdicts.len() as f64
    }

    /// Check whether the window agrees the job is failing.
    ///
    /// Only a full window can reach consensus. The reported reason is the
    /// most frequent failure reason; on a tie the reason seen first wins.
    /// Confidence and details come from the first verdict with that reason.
    pub fn evaluate(&self) -> Option<Consensus> {
        if !self.is_full() {
            return None;
        }
        let failure_ratio = self.failure_ratio();
        if failure_ratio < self.threshold {
            return None;
        }

        // (first verdict, count) per reason, in first-seen order.
        let mut groups: Vec<(&Verdict, usize)> = Vec::new();
        for verdict in self.verdicts.iter().filter(|v| v.is_failure) {
            match groups.iter_mut().find(|(first, _)| first.reason == verdict.reason) {
                Some((_, count)) => *count += 1,
                None => groups.push((verdict, 1)),
            }
        }

        let mut top: Option<(&Verdict, usize)> = None;
        for (first, count) in groups {
            if top.is_none_or(|(_, best)| count > best) {
                top = Some((first, count));
            }
        }

        top.map(|(first, _)| Consensus {
            reason: first.reason.clone(),
            confidence: first.confidence,
            details: first.details.clone(),
            failure_ratio,
        })
    }
}

/// Lifecycle of a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    Idle,
    Monitoring,
    Stopped,
    Faulted,
}

impl fmt::Display for SentinelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SentinelState::Idle => "idle",
            SentinelState::Monitoring => "monitoring",
            SentinelState::Stopped => "stopped",
            SentinelState::Faulted => "faulted",
        })
    }
}

/// Tunables of the monitoring loop.
#[derive(Debug, Clone)]
pub struct SentinelTiming {
    /// Backoff after the first consecutive error; multiplied by the error count.
    pub initial_backoff: Duration,
    /// Quiet period after a finding when the job is not cancelled.
    pub cooldown: Duration,
    pub max_consecutive_failures: u32,
    pub window_size: usize,
    pub threshold: f64,
}

impl Default for SentinelTiming {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(constants::INITIAL_BACKOFF_SECONDS),
            cooldown: Duration::from_secs(constants::FINDING_COOLDOWN_SECONDS),
            max_consecutive_failures: constants::MAX_CONSECUTIVE_FAILURES,
            window_size: constants::CONSENSUS_WINDOW_SIZE,
            threshold: constants::CONSENSUS_THRESHOLD,
        }
    }
}

/// Watches one job through its device camera.
pub struct JobSentinel {
    job_id: JobId,
    device: Device,
    analyzer: Arc<dyn FailureAnalyzer>,
    settings: Arc<dyn SettingsProvider>,
    findings: JobFailureChannel,
    timing: SentinelTiming,
    cancel: CancellationToken,
    state: Arc<Mutex<SentinelState>>,
    /// Whoever awaits the loop holds this lock until it ends.
    task: tokio::sync::Mutex<Option<JoinHandle<Result<(), SentinelError>>>>,
}

impl JobSentinel {
    pub fn new(
        job_id: JobId,
        device: Device,
        analyzer: Arc<dyn FailureAnalyzer>,
        settings: Arc<dyn SettingsProvider>,
        findings: JobFailureChannel,
    ) -> Self {
        Self::with_timing(
            job_id,
            device,
            analyzer,
            settings,
            findings,
            SentinelTiming::default(),
        )
    }

    pub fn with_timing(
        job_id: JobId,
        device: Device,
        analyzer: Arc<dyn FailureAnalyzer>,
        settings: Arc<dyn SettingsProvider>,
        findings: JobFailureChannel,
        timing: SentinelTiming,
    ) -> Self {
        Self {
            job_id,
            device,
            analyzer,
            settings,
            findings,
            timing,
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(SentinelState::Idle)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id
    }

    pub fn state(&self) -> SentinelState {
        *lock_state(&self.state)
    }

    /// Start the analyzer and spawn the monitoring loop.
    ///
    /// The loop ends when either `external` or this sentinel's own token is
    /// cancelled. Calling this on a sentinel that is not idle does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::StartFailed`] if the analyzer cannot be
    /// started; the sentinel is then `Faulted`.
    pub async fn start_monitoring(&self, external: &CancellationToken) -> Result<(), SentinelError> {
        {
            let mut state = lock_state(&self.state);
            if *state != SentinelState::Idle {
                debug!("Sentinel for job {} is already {}", self.job_id, *state);
                return Ok(());
            }
            *state = SentinelState::Monitoring;
        }

        if let Err(e) = self.analyzer.start(&self.device).await {
            *lock_state(&self.state) = SentinelState::Faulted;
            return Err(SentinelError::StartFailed {
                job_id: self.job_id,
                source: e.into(),
            });
        }

        let monitor = MonitorLoop {
            job_id: self.job_id,
            device_id: self.device.id,
            analyzer: Arc::clone(&self.analyzer),
            settings: Arc::clone(&self.settings),
            findings: self.findings.clone(),
            timing: self.timing.clone(),
            external: external.clone(),
            own: self.cancel.clone(),
            state: Arc::clone(&self.state),
        };
        *self.task.lock().await = Some(tokio::spawn(monitor.run()));

        info!(
            "Started monitoring job {} on device {} ({})",
            self.job_id, self.device.id, self.device.name
        );
        Ok(())
    }

    /// Cancel the loop, stop the analyzer and wait for the loop to end.
    ///
    /// # Errors
    ///
    /// Returns the loop's [`SentinelError::Faulted`] if it had already
    /// given up, or [`SentinelError::TaskFailed`] if it panicked.
    pub async fn stop_monitoring(&self) -> Result<(), SentinelError> {
        self.cancel.cancel();
        self.analyzer.stop().await;

        let outcome = self.join().await;
        let mut state = lock_state(&self.state);
        if *state != SentinelState::Faulted {
            *state = SentinelState::Stopped;
        }
        outcome
    }

    /// Wait for the loop to end on its own.
    pub async fn wait(&self) -> Result<(), SentinelError> {
        self.join().await
    }

    async fn join(&self) -> Result<(), SentinelError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(());
        };
        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) => {
                *lock_state(&self.state) = SentinelState::Faulted;
                Err(SentinelError::TaskFailed {
                    job_id: self.job_id,
                    reason: e.to_string(),
                })
            }
        };
        task.take();
        outcome
    }
}

fn lock_state(state: &Mutex<SentinelState>) -> std::sync::MutexGuard<'_, SentinelState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Step {
    Continue,
    Cooldown,
    Stop,
}

struct MonitorLoop {
    job_id: JobId,
    device_id: DeviceId,
    analyzer: Arc<dyn FailureAnalyzer>,
    settings: Arc<dyn SettingsProvider>,
    findings: JobFailureChannel,
    timing: SentinelTiming,
    external: CancellationToken,
    own: CancellationToken,
    state: Arc<Mutex<SentinelState>>,
}

impl MonitorLoop {
    async fn cancelled(&self) {
        tokio::select! {
            () = self.external.cancelled() => {}
            () = self.own.cancelled() => {}
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    async fn run(self) -> Result<(), SentinelError> {
        let mut window = ConsensusWindow::new(self.timing.window_size, self.timing.threshold);
        let mut consecutive_failures = 0u32;

        let outcome = loop {
            let interval = self.settings.settings().capture_interval();
            if !self.pause(interval).await {
                break Ok(());
            }

            let step = tokio::select! {
                biased;
                () = self.cancelled() => break Ok(()),
                step = self.iterate(&mut window) => step,
            };

            match step {
                Ok(step) => {
                    consecutive_failures = 0;
                    match step {
                        Step::Continue => {}
                        Step::Cooldown => {
                            if !self.pause(self.timing.cooldown).await {
                                break Ok(());
                            }
                        }
                        Step::Stop => break Ok(()),
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.timing.max_consecutive_failures {
                        error!(
                            "Monitoring job {} failed {} consecutive times, giving up: {:?}",
                            self.job_id, consecutive_failures, e
                        );
                        break Err(SentinelError::Faulted {
                            job_id: self.job_id,
                            failures: consecutive_failures,
                            source: e.into(),
                        });
                    }

                    let backoff = self.timing.initial_backoff * consecutive_failures;
                    if consecutive_failures == 1 {
                        warn!(
                            "Error monitoring job {} (attempt {}), retrying in {:?}: {}",
                            self.job_id, consecutive_failures, backoff, e
                        );
                    } else {
                        error!(
                            "Error monitoring job {} (attempt {}), retrying in {:?}: {:?}",
                            self.job_id, consecutive_failures, backoff, e
                        );
                    }
                    if !self.pause(backoff).await {
                        break Ok(());
                    }
                }
            }
        };

        self.analyzer.stop().await;
        *lock_state(&self.state) = match outcome {
            Ok(()) => SentinelState::Stopped,
            Err(_) => SentinelState::Faulted,
        };
        debug!("Monitoring loop for job {} ended", self.job_id);
        outcome
    }

    async fn iterate(&self, window: &mut ConsensusWindow) -> anyhow::Result<Step> {
        let Some(verdict) = self.analyzer.analyze().await? else {
            return Ok(Step::Continue);
        };
        window.push(verdict);

        let Some(consensus) = window.evaluate() else {
            return Ok(Step::Continue);
        };

        let action = self.settings.settings().failure_action;
        warn!(
            "Job {} on device {} is failing: {} ({:.0}% of recent frames, {:.2} confidence)",
            self.job_id,
            self.device_id,
            consensus.reason,
            consensus.failure_ratio * 100.0,
            consensus.confidence
        );
        self.findings.publish(JobFailureFinding {
            job_id: self.job_id,
            device_id: self.device_id,
            reason: consensus.reason,
            confidence: consensus.confidence,
            details: consensus.details,
            failure_ratio: consensus.failure_ratio,
            detected_at: Utc::now(),
        });
        window.clear();

        Ok(match action {
            FailureAction::CancelJob => Step::Stop,
            FailureAction::AlertOnly | FailureAction::PauseJob => Step::Cooldown,
        })
    }
}
