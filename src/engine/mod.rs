// Engine layer - test orchestration state machines
pub mod calibration;
pub mod capabilities;
pub mod quick_test;
pub mod session;

use std::time::Duration;

use thiserror::Error;

/// Why a test could not start. These are the only user-facing failures;
/// the caller corrects conditions and calls start again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("battery at {actual}%, need at least {required}% to start")]
    InsufficientCharge { required: u8, actual: u8 },
    #[error("cannot start a test while the battery is charging")]
    Charging,
    #[error("cannot start a test on AC power")]
    OnAcPower,
    #[error("another test session is already active")]
    SessionActive,
    #[error("no telemetry received yet")]
    NoTelemetry,
    #[error("diagnostics engine is not running")]
    EngineStopped,
}

/// Advisory progress snapshot for display; never part of the
/// correctness-critical path.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineProgress {
    pub phase: String,
    /// 0.0 - 1.0.
    pub fraction: f64,
    pub eta_hours: Option<f64>,
}

/// Phases the quick test asks to be woken up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    BaselineDone,
    PulseDone,
    RestDone,
}

/// A scheduled delay the engine requests from its runner. The generation
/// counter lets the engine ignore a timer armed before a stop/reset, so a
/// stale wakeup can never mutate fresh state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub kind: TimerKind,
    pub after: Duration,
    pub generation: u64,
}

/// Exponentially smoothed discharge-rate tracker backing the advisory
/// time-remaining estimate.
#[derive(Debug, Clone, Default)]
pub(crate) struct DischargeRateEstimator {
    /// Percent per hour, smoothed.
    rate: Option<f64>,
    last: Option<(chrono::DateTime<chrono::Utc>, u8)>,
}

impl DischargeRateEstimator {
    const ALPHA: f64 = 0.3;

    pub fn reset(&mut self) {
        self.rate = None;
        self.last = None;
    }

    pub fn observe(&mut self, at: chrono::DateTime<chrono::Utc>, percentage: u8) {
        if let Some((prev_at, prev_pct)) = self.last {
            let dt_h = (at - prev_at).num_milliseconds() as f64 / 3_600_000.0;
            if dt_h > 1e-6 && percentage <= prev_pct {
                let inst = (prev_pct - percentage) as f64 / dt_h;
                self.rate = Some(match self.rate {
                    Some(r) => r + Self::ALPHA * (inst - r),
                    None => inst,
                });
            }
        }
        self.last = Some((at, percentage));
    }

    /// Hours until `percentage` reaches `target`, if a rate is known.
    pub fn hours_until(&self, percentage: u8, target: u8) -> Option<f64> {
        let rate = self.rate.filter(|r| *r > 1e-6)?;
        if percentage <= target {
            return Some(0.0);
        }
        Some((percentage - target) as f64 / rate)
    }
}
