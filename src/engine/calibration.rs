// Full-discharge calibration engine
//
// Consumes the telemetry stream and measures the 100% -> 5% discharge arc.
// All transitions happen in response to discrete readings; the engine owns
// its sample buffer exclusively.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::reading::Reading;
use crate::domain::records::{CalibrationResult, SCHEMA_VERSION};
use crate::infrastructure::config::CalibrationConfig;

use super::capabilities::{HistoryStore, ReportGenerator};
use super::{DischargeRateEstimator, EngineProgress};

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationState {
    Idle,
    /// Waiting for the battery to be charged to the start threshold and
    /// unplugged.
    WaitingFull,
    Running {
        started_at: DateTime<Utc>,
        start_percent: u8,
    },
    /// Charging interrupted the arc. The buffer is retained for
    /// inspection, but the arc cannot resume; a fresh one starts from the
    /// threshold.
    Paused,
    Completed(CalibrationResult),
}

/// Persistable snapshot of an in-flight discharge arc, saved and restored
/// only through the engine's own boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    pub schema_version: u32,
    pub started_at: DateTime<Utc>,
    pub start_percent: u8,
    pub last_sample_at: DateTime<Utc>,
    pub last_percent: u8,
}

pub struct CalibrationEngine {
    state: CalibrationState,
    buffer: Vec<Reading>,
    config: CalibrationConfig,
    history: Arc<dyn HistoryStore>,
    reports: Arc<dyn ReportGenerator>,
    /// Timestamp and SOC of the last sample seen while running; survives a
    /// snapshot/restore so the gap policy has something to compare against.
    last_seen: Option<(DateTime<Utc>, u8)>,
    /// Raised when a data gap forced a reset; the caller acknowledges it.
    gap_notice: bool,
    rate: DischargeRateEstimator,
}

impl CalibrationEngine {
    pub fn new(
        config: CalibrationConfig,
        history: Arc<dyn HistoryStore>,
        reports: Arc<dyn ReportGenerator>,
    ) -> Self {
        Self {
            state: CalibrationState::Idle,
            buffer: Vec::new(),
            config,
            history,
            reports,
            last_seen: None,
            gap_notice: false,
            rate: DischargeRateEstimator::default(),
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    /// True while the engine holds the active test session.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            CalibrationState::WaitingFull | CalibrationState::Running { .. } | CalibrationState::Paused
        )
    }

    pub fn start(&mut self) {
        self.buffer.clear();
        self.last_seen = None;
        self.rate.reset();
        self.state = CalibrationState::WaitingFull;
        tracing::info!("calibration started, waiting for full charge");
    }

    /// Idempotent; safe from any state.
    pub fn stop(&mut self) {
        self.buffer.clear();
        self.last_seen = None;
        self.rate.reset();
        self.state = CalibrationState::Idle;
    }

    pub fn gap_notice(&self) -> bool {
        self.gap_notice
    }

    /// Clears the gap notice; returns whether one was pending.
    pub fn acknowledge_gap_notice(&mut self) -> bool {
        std::mem::take(&mut self.gap_notice)
    }

    /// Snapshot of a running arc, if one is in flight.
    pub fn snapshot(&self) -> Option<CalibrationSnapshot> {
        match (&self.state, self.last_seen) {
            (
                CalibrationState::Running {
                    started_at,
                    start_percent,
                },
                Some((last_sample_at, last_percent)),
            ) => Some(CalibrationSnapshot {
                schema_version: SCHEMA_VERSION,
                started_at: *started_at,
                start_percent: *start_percent,
                last_sample_at,
                last_percent,
            }),
            _ => None,
        }
    }

    /// Reattach to a previously running arc. The resume-gap policy is
    /// evaluated against the next reading, so the decision is the same
    /// whether the gap came from a restart or a stalled stream.
    pub fn restore(&mut self, snapshot: CalibrationSnapshot) {
        self.buffer.clear();
        self.rate.reset();
        self.last_seen = Some((snapshot.last_sample_at, snapshot.last_percent));
        self.state = CalibrationState::Running {
            started_at: snapshot.started_at,
            start_percent: snapshot.start_percent,
        };
        tracing::info!(
            start_percent = snapshot.start_percent,
            "calibration session restored"
        );
    }

    pub async fn on_reading(&mut self, reading: Reading) {
        match self.state.clone() {
            CalibrationState::Idle | CalibrationState::Completed(_) => {}
            CalibrationState::WaitingFull => {
                if reading.percentage >= self.config.start_threshold_percent
                    && reading.discharging()
                {
                    self.begin_arc(reading);
                }
            }
            CalibrationState::Paused => {
                if reading.percentage >= self.config.start_threshold_percent
                    && reading.discharging()
                {
                    // An interrupted arc is never resumed; remeasure.
                    self.begin_arc(reading);
                }
            }
            CalibrationState::Running {
                started_at,
                start_percent,
            } => {
                if !self.gap_acceptable(&reading) {
                    self.reset_for_gap();
                    return;
                }
                if reading.is_charging || !reading.on_battery {
                    tracing::info!("power restored, calibration paused");
                    self.state = CalibrationState::Paused;
                    return;
                }

                self.rate.observe(reading.timestamp, reading.percentage);
                self.last_seen = Some((reading.timestamp, reading.percentage));
                self.buffer.push(reading.clone());

                if reading.percentage <= self.config.completion_threshold_percent {
                    self.complete(started_at, start_percent, &reading).await;
                }
            }
        }
    }

    fn begin_arc(&mut self, reading: Reading) {
        tracing::info!(
            start_percent = reading.percentage,
            "discharge arc started"
        );
        self.buffer.clear();
        self.rate.reset();
        self.rate.observe(reading.timestamp, reading.percentage);
        self.last_seen = Some((reading.timestamp, reading.percentage));
        self.state = CalibrationState::Running {
            started_at: reading.timestamp,
            start_percent: reading.percentage,
        };
        self.buffer.push(reading);
    }

    /// Resume policy: a gap within the configured maximum always passes.
    /// A larger gap passes only when the device is still on battery, not
    /// charging, and SOC has not increased since the last sample.
    fn gap_acceptable(&self, reading: &Reading) -> bool {
        let Some((last_at, last_pct)) = self.last_seen else {
            return true;
        };
        let gap_secs = (reading.timestamp - last_at).num_seconds();
        if gap_secs <= self.config.max_resume_gap_secs as i64 {
            return true;
        }
        let plausible =
            reading.discharging() && reading.percentage <= last_pct;
        if plausible {
            tracing::info!(gap_secs, "continuing calibration across data gap");
        }
        plausible
    }

    fn reset_for_gap(&mut self) {
        tracing::warn!("unrecoverable data gap, calibration reset to waiting");
        self.buffer.clear();
        self.last_seen = None;
        self.rate.reset();
        self.gap_notice = true;
        self.state = CalibrationState::WaitingFull;
    }

    async fn complete(&mut self, started_at: DateTime<Utc>, start_percent: u8, last: &Reading) {
        let dt_hours = (last.timestamp - started_at).num_milliseconds() as f64 / 3_600_000.0;
        let d_percent = start_percent.saturating_sub(last.percentage) as f64;
        let discharge_per_hour = d_percent / dt_hours.max(0.001);
        let estimated_runtime_hours = if discharge_per_hour > 0.0 {
            100.0 / discharge_per_hour
        } else {
            0.0
        };

        let mut result = CalibrationResult {
            schema_version: SCHEMA_VERSION,
            started_at,
            finished_at: last.timestamp,
            start_percent,
            end_percent: last.percentage,
            duration_hours: dt_hours,
            avg_discharge_per_hour: discharge_per_hour,
            estimated_runtime_hours,
            report_path: None,
        };

        let history = self.history.calibration_history().await.unwrap_or_default();
        match self.reports.generate(&history, &result).await {
            Ok(path) => result.report_path = path,
            Err(e) => tracing::error!(error = %e, "calibration report generation failed"),
        }

        if let Err(e) = self.history.append_calibration(&result).await {
            tracing::error!(error = %e, "failed to persist calibration result");
        }

        tracing::info!(
            duration_hours = result.duration_hours,
            avg_discharge_per_hour = result.avg_discharge_per_hour,
            "calibration completed"
        );
        self.state = CalibrationState::Completed(result);
    }

    pub fn progress(&self) -> EngineProgress {
        match &self.state {
            CalibrationState::Idle => EngineProgress {
                phase: "idle".to_string(),
                fraction: 0.0,
                eta_hours: None,
            },
            CalibrationState::WaitingFull => EngineProgress {
                phase: "waiting_full_charge".to_string(),
                fraction: 0.0,
                eta_hours: None,
            },
            CalibrationState::Paused => EngineProgress {
                phase: "paused".to_string(),
                fraction: 0.0,
                eta_hours: None,
            },
            CalibrationState::Running { start_percent, .. } => {
                let current = self
                    .last_seen
                    .map(|(_, pct)| pct)
                    .unwrap_or(*start_percent);
                let floor = self.config.completion_threshold_percent;
                let span = start_percent.saturating_sub(floor).max(1) as f64;
                let done = start_percent.saturating_sub(current) as f64;
                EngineProgress {
                    phase: "discharging".to_string(),
                    fraction: (done / span).clamp(0.0, 1.0),
                    eta_hours: self.rate.hours_until(current, floor),
                }
            }
            CalibrationState::Completed(_) => EngineProgress {
                phase: "completed".to_string(),
                fraction: 1.0,
                eta_hours: Some(0.0),
            },
        }
    }
}
