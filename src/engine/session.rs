// Diagnostics session runner
//
// One task owns both engines and drains a bounded channel of readings and
// control messages, so every state transition happens on a single logical
// thread. Scheduled delays are armed here and re-enter the quick test when
// they fire; stopping clears the armed deadline before touching the engine,
// so no stale timer can mutate reset state.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::domain::reading::Reading;
use crate::infrastructure::config::EngineConfig;

use super::calibration::CalibrationEngine;
use super::capabilities::{
    ConstantPowerController, HistoryStore, LoadGenerator, ReportGenerator, TemperatureNormalizer,
};
use super::quick_test::{PowerPreset, QuickHealthTest};
use super::{EngineProgress, StartError, TimerKind, TimerRequest};

const CHANNEL_CAPACITY: usize = 100;

/// Which engine currently holds the test session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTest {
    Calibration,
    QuickTest,
}

/// Progress snapshot of the running session, for display only.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    pub active: Option<ActiveTest>,
    pub progress: Option<EngineProgress>,
    pub gap_notice: bool,
}

enum Control {
    Reading(Reading),
    StartCalibration(oneshot::Sender<Result<(), StartError>>),
    StartQuickTest(PowerPreset, oneshot::Sender<Result<(), StartError>>),
    Stop(oneshot::Sender<()>),
    Progress(oneshot::Sender<SessionProgress>),
    AcknowledgeGap(oneshot::Sender<bool>),
}

/// Handle to the session task. Dropping it shuts the task down after any
/// external load has been switched off.
#[derive(Clone)]
pub struct DiagnosticsSession {
    tx: mpsc::Sender<Control>,
}

impl DiagnosticsSession {
    pub fn spawn(
        config: EngineConfig,
        load: Arc<dyn LoadGenerator>,
        cp: Arc<dyn ConstantPowerController>,
        temperature: Arc<dyn TemperatureNormalizer>,
        history: Arc<dyn HistoryStore>,
        reports: Arc<dyn ReportGenerator>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let runner = Runner {
            calibration: CalibrationEngine::new(config.calibration.clone(), history.clone(), reports),
            quick: QuickHealthTest::new(config.quick_test.clone(), load, cp, temperature, history),
            active: None,
            last_reading: None,
            armed: None,
        };
        tokio::spawn(runner.run(rx));
        Self { tx }
    }

    /// Push one telemetry reading into the session.
    pub async fn submit(&self, reading: Reading) -> Result<(), StartError> {
        self.tx
            .send(Control::Reading(reading))
            .await
            .map_err(|_| StartError::EngineStopped)
    }

    pub async fn start_calibration(&self) -> Result<(), StartError> {
        self.request(Control::StartCalibration).await?
    }

    pub async fn start_quick_test(&self, preset: PowerPreset) -> Result<(), StartError> {
        self.request(|tx| Control::StartQuickTest(preset, tx)).await?
    }

    /// Stop whichever test is active; idempotent.
    pub async fn stop(&self) -> Result<(), StartError> {
        self.request(Control::Stop).await
    }

    pub async fn progress(&self) -> Result<SessionProgress, StartError> {
        self.request(Control::Progress).await
    }

    /// Acknowledge and clear a pending gap-reset notice; returns whether
    /// one was pending.
    pub async fn acknowledge_gap_notice(&self) -> Result<bool, StartError> {
        self.request(Control::AcknowledgeGap).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, StartError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| StartError::EngineStopped)?;
        rx.await.map_err(|_| StartError::EngineStopped)
    }
}

struct ArmedTimer {
    deadline: Instant,
    kind: TimerKind,
    generation: u64,
}

struct Runner {
    calibration: CalibrationEngine,
    quick: QuickHealthTest,
    active: Option<ActiveTest>,
    last_reading: Option<Reading>,
    armed: Option<ArmedTimer>,
}

impl Runner {
    async fn run(mut self, mut rx: mpsc::Receiver<Control>) {
        loop {
            let deadline = self.armed.as_ref().map(|a| a.deadline);
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(control) => self.handle(control).await,
                    // All handles dropped: make sure no external load
                    // stays on.
                    None => {
                        self.quick.stop().await;
                        self.calibration.stop();
                        break;
                    }
                },
                _ = sleep_until_armed(deadline), if deadline.is_some() => {
                    if let Some(armed) = self.armed.take() {
                        let next = self.quick.on_timer(armed.kind, armed.generation).await;
                        self.arm(next);
                    }
                    self.refresh_active();
                }
            }
        }
    }

    async fn handle(&mut self, control: Control) {
        match control {
            Control::Reading(reading) => {
                self.last_reading = Some(reading.clone());
                match self.active {
                    Some(ActiveTest::Calibration) => self.calibration.on_reading(reading).await,
                    Some(ActiveTest::QuickTest) => {
                        let next = self.quick.on_reading(reading).await;
                        if next.is_some() {
                            self.arm(next);
                        }
                    }
                    None => {}
                }
                self.refresh_active();
            }
            Control::StartCalibration(reply) => {
                let result = if self.active.is_some() {
                    Err(StartError::SessionActive)
                } else {
                    self.calibration.start();
                    self.active = Some(ActiveTest::Calibration);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Control::StartQuickTest(preset, reply) => {
                let result = if self.active.is_some() {
                    Err(StartError::SessionActive)
                } else {
                    match self.quick.start(self.last_reading.as_ref(), preset) {
                        Ok(()) => {
                            self.active = Some(ActiveTest::QuickTest);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                };
                let _ = reply.send(result);
            }
            Control::Stop(reply) => {
                // Cancel the deadline first so nothing fires mid-stop.
                self.armed = None;
                self.quick.stop().await;
                self.calibration.stop();
                self.active = None;
                let _ = reply.send(());
            }
            Control::Progress(reply) => {
                let progress = match self.active {
                    Some(ActiveTest::Calibration) => Some(self.calibration.progress()),
                    Some(ActiveTest::QuickTest) => Some(self.quick.progress()),
                    None => None,
                };
                let _ = reply.send(SessionProgress {
                    active: self.active,
                    progress,
                    gap_notice: self.calibration.gap_notice(),
                });
            }
            Control::AcknowledgeGap(reply) => {
                let _ = reply.send(self.calibration.acknowledge_gap_notice());
            }
        }
    }

    fn arm(&mut self, request: Option<TimerRequest>) {
        if let Some(req) = request {
            self.armed = Some(ArmedTimer {
                deadline: Instant::now() + req.after,
                kind: req.kind,
                generation: req.generation,
            });
        }
    }

    /// A finished engine no longer holds the session, which re-enables
    /// starting the other test.
    fn refresh_active(&mut self) {
        match self.active {
            Some(ActiveTest::Calibration) if !self.calibration.is_active() => {
                self.active = None;
            }
            Some(ActiveTest::QuickTest) if !self.quick.is_active() => {
                self.active = None;
                self.armed = None;
            }
            _ => {}
        }
    }
}

async fn sleep_until_armed(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
