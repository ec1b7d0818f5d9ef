// Abbreviated quick health test
//
// Baseline rest, staged pulse loads at descending SOC checkpoints, one
// constant-power energy window, then analysis. Timing is modeled as timer
// requests handed to the runner; the engine itself reacts only to discrete
// readings and timer wakeups.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::analysis::energy::{CpInterval, FALLBACK_AVG_OCV_V};
use crate::analysis::ocv::OcvAnalyzer;
use crate::analysis::scoring::{self, ScoreInputs};
use crate::analysis::{dcir, energy, microdrop};
use crate::domain::reading::Reading;
use crate::domain::records::{DcirPoint, QuickHealthResult, SCHEMA_VERSION};
use crate::infrastructure::config::QuickTestConfig;

use super::capabilities::{
    ConstantPowerController, HistoryStore, LoadGenerator, LoadProfile, TemperatureNormalizer,
};
use super::{DischargeRateEstimator, EngineProgress, StartError, TimerKind, TimerRequest};

/// Target power tiers for the constant-power window, as C-rate fractions of
/// the pack's design energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreset {
    Light,
    #[default]
    Moderate,
    Heavy,
}

impl PowerPreset {
    fn c_rate_fraction(&self) -> f64 {
        match self {
            Self::Light => 0.2,
            Self::Moderate => 0.35,
            Self::Heavy => 0.5,
        }
    }

    /// Derive the CP target from design capacity, using the nominal pack
    /// voltage for the Ah-to-Wh conversion.
    pub fn target_watts(&self, design_capacity_mah: f64) -> f64 {
        design_capacity_mah / 1000.0 * FALLBACK_AVG_OCV_V * self.c_rate_fraction()
    }
}

const PULSES_PER_CHECKPOINT: usize = 3;
const PULSE_PROFILES: [LoadProfile; PULSES_PER_CHECKPOINT] =
    [LoadProfile::Light, LoadProfile::Medium, LoadProfile::Heavy];

#[derive(Debug, Clone, PartialEq)]
pub enum PulsePhase {
    WaitingForSoc,
    /// Load applied; `start_index` is the first buffered sample under load.
    Loading { pulse: usize, start_index: usize },
    Resting { pulse: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuickTestState {
    Idle,
    /// Baseline rest; `resting` flips once SOC enters the start window.
    Calibrating { resting: bool },
    PulseTesting { target_soc: u8, phase: PulsePhase },
    EnergyWindow { end_soc: u8 },
    Analyzing,
    Completed(Box<QuickHealthResult>),
    Error(String),
}

pub struct QuickHealthTest {
    state: QuickTestState,
    config: QuickTestConfig,
    load: Arc<dyn LoadGenerator>,
    cp: Arc<dyn ConstantPowerController>,
    temperature: Arc<dyn TemperatureNormalizer>,
    history: Arc<dyn HistoryStore>,

    buffer: Vec<Reading>,
    dcir_points: Vec<DcirPoint>,
    cp_intervals: Vec<CpInterval>,
    /// Buffer index where the currently open CP interval began.
    cp_open_start: Option<usize>,
    /// Which checkpoint the pulse protocol is on.
    checkpoint_idx: usize,
    energy_window_done: bool,
    load_active: bool,
    preset: PowerPreset,
    target_power_w: f64,
    /// Bumped on every stop/reset; stale timer wakeups carry the old value
    /// and are discarded.
    generation: u64,
    rate: DischargeRateEstimator,
}

impl QuickHealthTest {
    pub fn new(
        config: QuickTestConfig,
        load: Arc<dyn LoadGenerator>,
        cp: Arc<dyn ConstantPowerController>,
        temperature: Arc<dyn TemperatureNormalizer>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            state: QuickTestState::Idle,
            config,
            load,
            cp,
            temperature,
            history,
            buffer: Vec::new(),
            dcir_points: Vec::new(),
            cp_intervals: Vec::new(),
            cp_open_start: None,
            checkpoint_idx: 0,
            energy_window_done: false,
            load_active: false,
            preset: PowerPreset::default(),
            target_power_w: 0.0,
            generation: 0,
            rate: DischargeRateEstimator::default(),
        }
    }

    pub fn state(&self) -> &QuickTestState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            QuickTestState::Calibrating { .. }
                | QuickTestState::PulseTesting { .. }
                | QuickTestState::EnergyWindow { .. }
                | QuickTestState::Analyzing
        )
    }

    pub fn collected_dcir_points(&self) -> &[DcirPoint] {
        &self.dcir_points
    }

    /// Check preconditions against the latest telemetry and begin the
    /// baseline phase. A violation lands in the terminal `Error` state and
    /// is returned; the caller corrects conditions and starts again.
    pub fn start(
        &mut self,
        latest: Option<&Reading>,
        preset: PowerPreset,
    ) -> Result<(), StartError> {
        let check = || -> Result<&Reading, StartError> {
            let r = latest.ok_or(StartError::NoTelemetry)?;
            if r.percentage < self.config.min_start_soc {
                return Err(StartError::InsufficientCharge {
                    required: self.config.min_start_soc,
                    actual: r.percentage,
                });
            }
            if r.is_charging {
                return Err(StartError::Charging);
            }
            if !r.on_battery {
                return Err(StartError::OnAcPower);
            }
            Ok(r)
        };

        match check() {
            Ok(r) => {
                self.reset_buffers();
                self.generation += 1;
                self.preset = preset;
                self.target_power_w = preset.target_watts(r.design_capacity_mah);
                self.state = QuickTestState::Calibrating { resting: false };
                tracing::info!(
                    soc = r.percentage,
                    target_power_w = self.target_power_w,
                    "quick health test started"
                );
                Ok(())
            }
            Err(e) => {
                self.state = QuickTestState::Error(e.to_string());
                Err(e)
            }
        }
    }

    /// Halt everything and return to idle. Idempotent; leaves no external
    /// load or CP control active and no timer that could still fire.
    pub async fn stop(&mut self) {
        self.generation += 1;
        if self.load_active {
            if let Err(e) = self.load.off().await {
                tracing::error!(error = %e, "failed to switch load off during stop");
            }
            self.load_active = false;
        }
        if self.cp_open_start.is_some() {
            if let Err(e) = self.cp.stop().await {
                tracing::error!(error = %e, "failed to stop CP controller during stop");
            }
        }
        self.reset_buffers();
        self.state = QuickTestState::Idle;
    }

    fn reset_buffers(&mut self) {
        self.buffer.clear();
        self.dcir_points.clear();
        self.cp_intervals.clear();
        self.cp_open_start = None;
        self.checkpoint_idx = 0;
        self.energy_window_done = false;
        self.rate.reset();
    }

    pub async fn on_reading(&mut self, reading: Reading) -> Option<TimerRequest> {
        if !self.is_active() {
            return None;
        }
        self.rate.observe(reading.timestamp, reading.percentage);
        self.buffer.push(reading.clone());

        match self.state.clone() {
            QuickTestState::Calibrating { resting: false } => {
                // Above the window the battery is still too full for a
                // comparable resting measurement.
                if reading.percentage <= self.config.baseline_upper_soc {
                    tracing::debug!(soc = reading.percentage, "baseline rest started");
                    self.state = QuickTestState::Calibrating { resting: true };
                    return Some(self.timer(
                        TimerKind::BaselineDone,
                        Duration::from_secs(self.config.baseline_duration_secs),
                    ));
                }
                None
            }
            QuickTestState::PulseTesting {
                target_soc,
                phase: PulsePhase::WaitingForSoc,
            } => {
                if reading.percentage <= target_soc {
                    return self.begin_pulse(target_soc, 0).await;
                }
                None
            }
            QuickTestState::EnergyWindow { end_soc } => {
                if reading.percentage <= end_soc {
                    self.finish_energy_window().await;
                }
                None
            }
            _ => None,
        }
    }

    pub async fn on_timer(&mut self, kind: TimerKind, generation: u64) -> Option<TimerRequest> {
        if generation != self.generation {
            tracing::debug!(?kind, "ignoring stale timer");
            return None;
        }

        match (self.state.clone(), kind) {
            (QuickTestState::Calibrating { resting: true }, TimerKind::BaselineDone) => {
                let target = self.config.checkpoints.first().copied();
                match target {
                    Some(t) => {
                        tracing::info!(target_soc = t, "baseline done, pulse testing begins");
                        self.state = QuickTestState::PulseTesting {
                            target_soc: t,
                            phase: PulsePhase::WaitingForSoc,
                        };
                    }
                    None => self.finish_protocol().await,
                }
                None
            }
            (
                QuickTestState::PulseTesting {
                    target_soc,
                    phase: PulsePhase::Loading { pulse, start_index },
                },
                TimerKind::PulseDone,
            ) => {
                if let Err(e) = self.load.off().await {
                    self.fail(format!("load generator failed: {e}")).await;
                    return None;
                }
                self.load_active = false;

                match dcir::estimate(&self.buffer, start_index, self.config.dcir_window_secs) {
                    Some(point) => {
                        tracing::debug!(
                            soc = point.soc_percent,
                            resistance_mohm = point.resistance_mohm,
                            "DCIR point collected"
                        );
                        self.dcir_points.push(point);
                    }
                    None => {
                        tracing::warn!(target_soc, pulse, "DCIR measurement dropped");
                    }
                }

                self.state = QuickTestState::PulseTesting {
                    target_soc,
                    phase: PulsePhase::Resting { pulse },
                };
                Some(self.timer(
                    TimerKind::RestDone,
                    Duration::from_secs(self.config.rest_duration_secs),
                ))
            }
            (
                QuickTestState::PulseTesting {
                    target_soc,
                    phase: PulsePhase::Resting { pulse },
                },
                TimerKind::RestDone,
            ) => {
                let next = pulse + 1;
                if next < PULSES_PER_CHECKPOINT {
                    self.begin_pulse(target_soc, next).await
                } else {
                    self.checkpoint_done(target_soc).await;
                    None
                }
            }
            _ => None,
        }
    }

    async fn begin_pulse(&mut self, target_soc: u8, pulse: usize) -> Option<TimerRequest> {
        // The transition sample is the first one collected under load.
        let start_index = self.buffer.len();
        if let Err(e) = self.load.apply(PULSE_PROFILES[pulse]).await {
            self.fail(format!("load generator failed: {e}")).await;
            return None;
        }
        self.load_active = true;
        tracing::debug!(target_soc, pulse, "load pulse applied");
        self.state = QuickTestState::PulseTesting {
            target_soc,
            phase: PulsePhase::Loading { pulse, start_index },
        };
        Some(self.timer(
            TimerKind::PulseDone,
            Duration::from_secs(self.config.pulse_duration_secs),
        ))
    }

    /// All three pulses at a checkpoint are done. After the first
    /// checkpoint the energy window runs before pulse testing resumes.
    async fn checkpoint_done(&mut self, target_soc: u8) {
        if self.checkpoint_idx == 0 && !self.energy_window_done {
            let end_soc = target_soc.saturating_sub(self.config.cp_span_percent);
            if let Err(e) = self.cp.start(self.target_power_w).await {
                self.fail(format!("CP controller failed: {e}")).await;
                return;
            }
            self.cp_open_start = Some(self.buffer.len());
            tracing::info!(
                end_soc,
                target_power_w = self.target_power_w,
                "constant-power energy window started"
            );
            self.state = QuickTestState::EnergyWindow { end_soc };
            return;
        }
        self.advance_checkpoint().await;
    }

    async fn finish_energy_window(&mut self) {
        if let Err(e) = self.cp.stop().await {
            tracing::error!(error = %e, "CP controller stop failed");
        }
        if let Some(start) = self.cp_open_start.take() {
            let end = self.buffer.len().saturating_sub(1);
            if end > start {
                self.cp_intervals.push(CpInterval { start, end });
            }
        }
        self.energy_window_done = true;
        tracing::info!("constant-power energy window finished");
        self.advance_checkpoint().await;
    }

    async fn advance_checkpoint(&mut self) {
        self.checkpoint_idx += 1;
        match self.config.checkpoints.get(self.checkpoint_idx).copied() {
            Some(next) => {
                tracing::info!(target_soc = next, "waiting for next checkpoint");
                self.state = QuickTestState::PulseTesting {
                    target_soc: next,
                    phase: PulsePhase::WaitingForSoc,
                };
            }
            None => self.finish_protocol().await,
        }
    }

    async fn finish_protocol(&mut self) {
        self.state = QuickTestState::Analyzing;
        tracing::info!(
            samples = self.buffer.len(),
            dcir_points = self.dcir_points.len(),
            "protocol complete, analyzing"
        );
        let result = self.run_analysis();

        if let Err(e) = self.history.append_quick(&result).await {
            tracing::error!(error = %e, "failed to persist quick test result");
        }

        tracing::info!(
            composite_score = result.composite_score,
            "quick health test completed"
        );
        self.state = QuickTestState::Completed(Box::new(result));
    }

    fn run_analysis(&self) -> QuickHealthResult {
        let samples = &self.buffer;
        let analyzer = OcvAnalyzer::new(self.dcir_points.clone())
            .with_knee_scoring(self.config.knee_healthy_soc, self.config.knee_scoring_span);
        let curve = analyzer.build_curve(samples, self.config.ocv_bin_percent);
        let avg_ocv = if curve.is_empty() {
            FALLBACK_AVG_OCV_V
        } else {
            curve.iter().map(|p| p.ocv_voltage).sum::<f64>() / curve.len() as f64
        };

        let design_capacity_mah = samples
            .last()
            .map(|r| r.design_capacity_mah)
            .unwrap_or(0.0);
        let energy = energy::analyze(
            samples,
            &self.cp_intervals,
            self.target_power_w,
            design_capacity_mah,
            avg_ocv,
        );

        let dcir_analysis = dcir::analyze(&self.dcir_points);
        let (dcir_50, dcir_20, dcir_trend) = match &dcir_analysis {
            Some(a) => (
                Some(a.resistance_at_50_mohm),
                Some(a.resistance_at_20_mohm),
                a.trend_mohm_per_pct,
            ),
            None => (None, None, None),
        };

        let knee = analyzer.find_knee(&curve);

        let drops = microdrop::analyze(samples);
        let stability = microdrop::stability_score(&drops);

        let soh_capacity = samples
            .last()
            .map(|r| {
                if r.design_capacity_mah > 0.0 {
                    (r.max_capacity_mah / r.design_capacity_mah * 100.0).clamp(0.0, 100.0)
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        let avg_temperature_c = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|r| r.temperature_c).sum::<f64>() / samples.len() as f64
        };
        let adjustment =
            self.temperature
                .normalize(energy.soh_energy_percent, dcir_50, avg_temperature_c);

        let composite_score = scoring::composite_score(&ScoreInputs {
            normalized_soh: adjustment.normalized_soh,
            dcir_50_mohm: dcir_50,
            dcir_20_mohm: dcir_20,
            soh_capacity,
            stability_score: stability,
            temperature_quality: adjustment.quality_score,
        });

        QuickHealthResult {
            schema_version: SCHEMA_VERSION,
            completed_at: samples.last().map(|r| r.timestamp).unwrap_or_else(Utc::now),
            energy_delivered_wh: energy.energy_delivered_wh,
            collected_soc_span: energy.collected_soc_span,
            soh_energy_percent: energy.soh_energy_percent,
            soh_capacity_percent: soh_capacity,
            avg_power_w: energy.avg_power_w,
            target_power_w: self.target_power_w,
            power_control_quality: energy.power_control_quality,
            dcir_50_mohm: dcir_50,
            dcir_20_mohm: dcir_20,
            dcir_trend_mohm_per_pct: dcir_trend,
            knee_soc: knee.map(|k| k.knee_soc),
            knee_index: knee.map(|k| k.knee_index),
            micro_drop_count: drops.total,
            micro_drops_above_20: drops.above_20,
            micro_drops_below_20: drops.below_20,
            micro_drop_rate_per_hour: drops.rate_per_hour,
            micro_drop_rate_above_20: drops.rate_above_20,
            micro_drop_rate_below_20: drops.rate_below_20,
            unstable_under_load: drops.unstable_under_load,
            stability_score: stability,
            avg_temperature_c,
            temperature_quality: adjustment.quality_score,
            normalized_soh_percent: adjustment.normalized_soh,
            normalized_dcir_50_mohm: adjustment.normalized_dcir_50_mohm,
            composite_score,
            recommendation: scoring::recommend(composite_score),
        }
    }

    async fn fail(&mut self, message: String) {
        tracing::error!(message, "quick test aborted");
        self.generation += 1;
        if self.load_active {
            let _ = self.load.off().await;
            self.load_active = false;
        }
        if self.cp_open_start.take().is_some() {
            let _ = self.cp.stop().await;
        }
        self.state = QuickTestState::Error(message);
    }

    fn timer(&self, kind: TimerKind, after: Duration) -> TimerRequest {
        TimerRequest {
            kind,
            after,
            generation: self.generation,
        }
    }

    pub fn progress(&self) -> EngineProgress {
        let last_soc = self.buffer.last().map(|r| r.percentage);
        let final_target = self.config.checkpoints.last().copied().unwrap_or(20);
        let eta_hours = last_soc.and_then(|soc| self.rate.hours_until(soc, final_target));

        let (phase, fraction) = match &self.state {
            QuickTestState::Idle => ("idle".to_string(), 0.0),
            QuickTestState::Calibrating { resting } => {
                let label = if *resting {
                    "baseline_resting"
                } else {
                    "baseline_waiting"
                };
                (label.to_string(), 0.05)
            }
            QuickTestState::PulseTesting { target_soc, .. } => {
                let total = self.config.checkpoints.len().max(1) as f64;
                let fraction = 0.1 + 0.75 * (self.checkpoint_idx as f64 / total);
                (format!("pulse_testing({target_soc})"), fraction)
            }
            QuickTestState::EnergyWindow { end_soc } => {
                (format!("energy_window({end_soc})"), 0.4)
            }
            QuickTestState::Analyzing => ("analyzing".to_string(), 0.95),
            QuickTestState::Completed(_) => ("completed".to_string(), 1.0),
            QuickTestState::Error(_) => ("error".to_string(), 0.0),
        };

        EngineProgress {
            phase,
            fraction,
            eta_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::simulated::{
        MemoryHistoryStore, SimulatedLoadBank, SimulatedPowerController,
    };
    use crate::infrastructure::temperature::ReferenceNormalizer;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn reading(soc: u8, offset_secs: i64) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
                + ChronoDuration::seconds(offset_secs),
            percentage: soc,
            is_charging: false,
            on_battery: true,
            voltage_v: 12.0,
            current_ma: -1200.0,
            temperature_c: 25.0,
            max_capacity_mah: 4600.0,
            design_capacity_mah: 5000.0,
        }
    }

    struct Harness {
        engine: QuickHealthTest,
        load: Arc<SimulatedLoadBank>,
        cp: Arc<SimulatedPowerController>,
        history: Arc<MemoryHistoryStore>,
    }

    fn harness() -> Harness {
        let load = Arc::new(SimulatedLoadBank::default());
        let cp = Arc::new(SimulatedPowerController::default());
        let history = Arc::new(MemoryHistoryStore::default());
        let engine = QuickHealthTest::new(
            QuickTestConfig::default(),
            load.clone(),
            cp.clone(),
            Arc::new(ReferenceNormalizer::default()),
            history.clone(),
        );
        Harness {
            engine,
            load,
            cp,
            history,
        }
    }

    #[tokio::test]
    async fn test_preconditions_reject_low_charge() {
        let mut h = harness();
        let r = reading(70, 0);
        let err = h.engine.start(Some(&r), PowerPreset::Moderate).unwrap_err();
        assert_eq!(
            err,
            StartError::InsufficientCharge {
                required: 85,
                actual: 70
            }
        );
        assert!(matches!(h.engine.state(), QuickTestState::Error(_)));
    }

    #[tokio::test]
    async fn test_preconditions_reject_charging_and_ac() {
        let mut h = harness();
        let mut r = reading(92, 0);
        r.is_charging = true;
        assert_eq!(
            h.engine.start(Some(&r), PowerPreset::Moderate),
            Err(StartError::Charging)
        );

        let mut r = reading(92, 0);
        r.on_battery = false;
        assert_eq!(
            h.engine.start(Some(&r), PowerPreset::Moderate),
            Err(StartError::OnAcPower)
        );

        assert_eq!(
            h.engine.start(None, PowerPreset::Moderate),
            Err(StartError::NoTelemetry)
        );
    }

    #[tokio::test]
    async fn test_baseline_starts_immediately_at_90() {
        let mut h = harness();
        let r = reading(90, 0);
        h.engine.start(Some(&r), PowerPreset::Moderate).unwrap();
        assert_eq!(
            h.engine.state(),
            &QuickTestState::Calibrating { resting: false }
        );

        let req = h.engine.on_reading(reading(90, 1)).await.unwrap();
        assert_eq!(req.kind, TimerKind::BaselineDone);
        assert_eq!(req.after, Duration::from_secs(150));
        assert_eq!(
            h.engine.state(),
            &QuickTestState::Calibrating { resting: true }
        );

        h.engine.on_timer(TimerKind::BaselineDone, req.generation).await;
        assert_eq!(
            h.engine.state(),
            &QuickTestState::PulseTesting {
                target_soc: 80,
                phase: PulsePhase::WaitingForSoc
            }
        );
    }

    #[tokio::test]
    async fn test_baseline_waits_above_95() {
        let mut h = harness();
        let r = reading(97, 0);
        h.engine.start(Some(&r), PowerPreset::Moderate).unwrap();
        assert!(h.engine.on_reading(reading(97, 1)).await.is_none());
        assert!(h.engine.on_reading(reading(96, 60)).await.is_none());
        let req = h.engine.on_reading(reading(95, 120)).await.unwrap();
        assert_eq!(req.kind, TimerKind::BaselineDone);
    }

    /// Samples during a pulse so DCIR estimation has a clean transition:
    /// higher drain and sagged voltage while loaded.
    async fn feed_pulse_samples(h: &mut Harness, soc: u8, t: &mut i64) {
        for k in 1..=10 {
            let mut r = reading(soc, *t + k);
            r.voltage_v = 11.9;
            r.current_ma = -3200.0;
            h.engine.on_reading(r).await;
        }
        *t += 10;
    }

    async fn feed_rest_samples(h: &mut Harness, soc: u8, t: &mut i64) {
        for k in 1..=25 {
            h.engine.on_reading(reading(soc, *t + k)).await;
        }
        *t += 25;
    }

    /// Run the three pulses of one checkpoint end to end. `soc` is where
    /// the battery actually sits when the checkpoint is reached; it may be
    /// below the nominal target. Timestamps jump 10 minutes ahead first so
    /// the SOC step between checkpoints is not mistaken for a micro-drop.
    async fn run_checkpoint(h: &mut Harness, soc: u8, t: &mut i64) {
        *t += 600;
        let req = h.engine.on_reading(reading(soc, *t)).await.unwrap();
        assert_eq!(req.kind, TimerKind::PulseDone);
        assert!(h.load.applied().is_some());
        feed_pulse_samples(h, soc, t).await;
        let rest = h
            .engine
            .on_timer(TimerKind::PulseDone, req.generation)
            .await
            .unwrap();
        assert_eq!(rest.kind, TimerKind::RestDone);
        assert!(h.load.applied().is_none());

        for pulse in 1..=2 {
            feed_rest_samples(h, soc, t).await;
            let req = h
                .engine
                .on_timer(TimerKind::RestDone, h.engine.generation)
                .await
                .unwrap();
            assert_eq!(req.kind, TimerKind::PulseDone, "pulse {pulse}");
            feed_pulse_samples(h, soc, t).await;
            let rest = h
                .engine
                .on_timer(TimerKind::PulseDone, req.generation)
                .await
                .unwrap();
            assert_eq!(rest.kind, TimerKind::RestDone);
        }
        feed_rest_samples(h, soc, t).await;
        // Final rest timer closes the checkpoint.
        h.engine
            .on_timer(TimerKind::RestDone, h.engine.generation)
            .await;
    }

    #[tokio::test]
    async fn test_full_protocol_completes_with_result() {
        let mut h = harness();
        h.engine
            .start(Some(&reading(90, 0)), PowerPreset::Moderate)
            .unwrap();
        let mut t: i64 = 1;

        let req = h.engine.on_reading(reading(90, t)).await.unwrap();
        h.engine.on_timer(TimerKind::BaselineDone, req.generation).await;

        // Checkpoint 80: three pulses, then the CP window opens. The
        // first pulse of each checkpoint has only the arrival sample
        // before its transition, so its estimate is dropped by design of
        // the rejection policy; the two rested pulses measure cleanly.
        run_checkpoint(&mut h, 80, &mut t).await;
        assert!(matches!(
            h.engine.state(),
            QuickTestState::EnergyWindow { end_soc: 50 }
        ));
        assert!((h.cp.target().unwrap() - PowerPreset::Moderate.target_watts(5000.0)).abs() < 1e-9);

        // Discharge 79 -> 51 under CP at 1% per 6 minutes, samples every
        // 6 s, then the closing sample at 50.
        for (k, soc) in (51..=79).rev().enumerate() {
            for s in 0..60i64 {
                let mut r = reading(soc, t + (k as i64 * 360) + s * 6);
                r.current_ma = -1600.0;
                h.engine.on_reading(r).await;
            }
        }
        t += 29 * 360;
        let mut closing = reading(50, t);
        closing.current_ma = -1600.0;
        h.engine.on_reading(closing).await;
        assert!(h.cp.target().is_none(), "CP must stop at the span floor");
        assert!(matches!(
            h.engine.state(),
            QuickTestState::PulseTesting {
                target_soc: 60,
                ..
            }
        ));

        // SOC already passed 60 during the window, so the 60% checkpoint
        // runs where the battery sits now.
        run_checkpoint(&mut h, 50, &mut t).await;
        run_checkpoint(&mut h, 40, &mut t).await;
        run_checkpoint(&mut h, 20, &mut t).await;

        let QuickTestState::Completed(result) = h.engine.state() else {
            panic!("expected completion, got {:?}", h.engine.state());
        };
        assert!(result.dcir_50_mohm.is_some());
        assert!(result.collected_soc_span > 25.0);
        assert!(result.composite_score > 0.0);
        assert!(!result.unstable_under_load);
        assert_eq!(h.history.quick_history().await.unwrap().len(), 1);
        // Two rested pulses per checkpoint survive estimation.
        assert_eq!(h.engine.collected_dcir_points().len(), 8);
    }

    #[tokio::test]
    async fn test_stop_cancels_load_and_timers() {
        let mut h = harness();
        h.engine
            .start(Some(&reading(90, 0)), PowerPreset::Moderate)
            .unwrap();
        let mut t: i64 = 1;
        let req = h.engine.on_reading(reading(90, t)).await.unwrap();
        h.engine.on_timer(TimerKind::BaselineDone, req.generation).await;

        // Enter a pulse, then stop mid-load.
        let pulse_req = h.engine.on_reading(reading(80, t + 1)).await.unwrap();
        t += 1;
        assert!(h.load.applied().is_some());
        h.engine.stop().await;
        assert_eq!(h.engine.state(), &QuickTestState::Idle);
        assert!(h.load.applied().is_none());

        // The already-armed pulse timer is stale and must be a no-op.
        let follow_up = h
            .engine
            .on_timer(pulse_req.kind, pulse_req.generation)
            .await;
        assert!(follow_up.is_none());
        assert_eq!(h.engine.state(), &QuickTestState::Idle);

        // Stop again from idle: still fine.
        h.engine.stop().await;
        assert_eq!(h.engine.state(), &QuickTestState::Idle);
        let _ = t;
    }

    #[tokio::test]
    async fn test_progress_labels_follow_protocol() {
        let mut h = harness();
        assert_eq!(h.engine.progress().phase, "idle");
        h.engine
            .start(Some(&reading(90, 0)), PowerPreset::Moderate)
            .unwrap();
        assert_eq!(h.engine.progress().phase, "baseline_waiting");
        let req = h.engine.on_reading(reading(90, 1)).await.unwrap();
        assert_eq!(h.engine.progress().phase, "baseline_resting");
        h.engine.on_timer(TimerKind::BaselineDone, req.generation).await;
        assert_eq!(h.engine.progress().phase, "pulse_testing(80)");
    }
}
