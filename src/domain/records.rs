// Diagnostic result records - the durable contract of the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version tag written into every persisted record so historical data stays
/// loadable across revisions.
pub const SCHEMA_VERSION: u32 = 1;

/// One internal-resistance measurement from a completed load pulse.
///
/// Never constructed outside (0, 10000) milliohm; out-of-range estimates are
/// discarded at measurement time.
#[derive(Debug, Clone, PartialEq)]
pub struct DcirPoint {
    pub soc_percent: f64,
    pub resistance_mohm: f64,
    pub timestamp: DateTime<Utc>,
    /// Measurement confidence, 0-100.
    pub quality: f64,
}

/// One bin of the reconstructed open-circuit-voltage curve.
#[derive(Debug, Clone, PartialEq)]
pub struct OcvPoint {
    /// Bin center SOC.
    pub soc_percent: f64,
    pub ocv_voltage: f64,
    /// Average timestamp of the samples in the bin.
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one full-discharge calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub schema_version: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_percent: u8,
    pub end_percent: u8,
    pub duration_hours: f64,
    pub avg_discharge_per_hour: f64,
    pub estimated_runtime_hours: f64,
    #[serde(default)]
    pub report_path: Option<String>,
}

/// Outcome of one abbreviated quick health test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickHealthResult {
    pub schema_version: u32,
    pub completed_at: DateTime<Utc>,

    // Energy window
    pub energy_delivered_wh: f64,
    /// SOC percentage points actually covered under constant-power control.
    pub collected_soc_span: f64,
    pub soh_energy_percent: f64,
    pub soh_capacity_percent: f64,
    pub avg_power_w: f64,
    pub target_power_w: f64,
    pub power_control_quality: f64,

    // Internal resistance
    pub dcir_50_mohm: Option<f64>,
    pub dcir_20_mohm: Option<f64>,
    pub dcir_trend_mohm_per_pct: Option<f64>,

    // OCV knee
    pub knee_soc: Option<f64>,
    pub knee_index: Option<f64>,

    // Micro-drop statistics
    pub micro_drop_count: u32,
    pub micro_drops_above_20: u32,
    pub micro_drops_below_20: u32,
    pub micro_drop_rate_per_hour: f64,
    pub micro_drop_rate_above_20: f64,
    pub micro_drop_rate_below_20: f64,
    pub unstable_under_load: bool,
    pub stability_score: f64,

    // Temperature normalization
    pub avg_temperature_c: f64,
    pub temperature_quality: f64,
    pub normalized_soh_percent: f64,
    pub normalized_dcir_50_mohm: Option<f64>,

    pub composite_score: f64,
    pub recommendation: Recommendation,
}

/// Four-tier verdict derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Excellent,
    Good,
    Fair,
    ReplaceSoon,
}

impl Recommendation {
    pub fn for_score(score: f64) -> Self {
        if score >= 85.0 {
            Self::Excellent
        } else if score >= 70.0 {
            Self::Good
        } else if score >= 50.0 {
            Self::Fair
        } else {
            Self::ReplaceSoon
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Self::Excellent => "Battery is in excellent condition",
            Self::Good => "Battery is healthy; no action needed",
            Self::Fair => "Battery shows measurable wear; monitor capacity",
            Self::ReplaceSoon => "Battery is significantly degraded; plan a replacement",
        }
    }
}
