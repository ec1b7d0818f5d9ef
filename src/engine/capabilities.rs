// Capability traits for the engine's external collaborators
//
// The engines call out through these seams and are never called back except
// through the reading channel, so ownership stays unidirectional.

use async_trait::async_trait;

use crate::domain::records::{CalibrationResult, QuickHealthResult};

/// Discharge load intensities the pulse protocol steps through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProfile {
    Light,
    Medium,
    Heavy,
}

/// Synthetic load generator used to create controlled discharge pulses.
#[async_trait]
pub trait LoadGenerator: Send + Sync {
    async fn apply(&self, profile: LoadProfile) -> anyhow::Result<()>;
    async fn off(&self) -> anyhow::Result<()>;
}

/// Duty-cycle controller holding power draw near a fixed target.
#[async_trait]
pub trait ConstantPowerController: Send + Sync {
    async fn start(&self, target_watts: f64) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    /// Reported for status only; the engine drives the controller purely
    /// through start/stop.
    async fn current_power(&self) -> anyhow::Result<f64>;
}

/// Result of compensating measurements for ambient temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureAdjustment {
    pub normalized_soh: f64,
    pub normalized_dcir_50_mohm: Option<f64>,
    /// 0-100; how trustworthy measurements at this temperature are.
    pub quality_score: f64,
}

/// Temperature normalization model for SOH and resistance figures.
pub trait TemperatureNormalizer: Send + Sync {
    fn normalize(
        &self,
        soh_energy: f64,
        dcir_at_50_mohm: Option<f64>,
        avg_temperature_c: f64,
    ) -> TemperatureAdjustment;
}

/// Append-only, size-capped persistence for completed results. Failures are
/// reported to the caller for logging; they never block the state machines.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_calibration(&self, result: &CalibrationResult) -> anyhow::Result<()>;
    async fn append_quick(&self, result: &QuickHealthResult) -> anyhow::Result<()>;
    /// Newest first.
    async fn calibration_history(&self) -> anyhow::Result<Vec<CalibrationResult>>;
    /// Newest first.
    async fn quick_history(&self) -> anyhow::Result<Vec<QuickHealthResult>>;
}

/// Report generation collaborator invoked when a calibration completes.
/// Returns the path of the written report, if any.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(
        &self,
        history: &[CalibrationResult],
        result: &CalibrationResult,
    ) -> anyhow::Result<Option<String>>;
}

/// Default no-op report collaborator for deployments without reporting.
pub struct NoReports;

#[async_trait]
impl ReportGenerator for NoReports {
    async fn generate(
        &self,
        _history: &[CalibrationResult],
        _result: &CalibrationResult,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
