// Composite health scoring

use crate::domain::records::Recommendation;

/// Resistance at which the 50%-SOC sub-score starts losing points.
const DCIR_50_CENTER_MOHM: f64 = 100.0;
/// Resistance at which the 20%-SOC sub-score starts losing points.
const DCIR_20_CENTER_MOHM: f64 = 200.0;

const WEIGHT_NORMALIZED_SOH: f64 = 0.40;
const WEIGHT_DCIR: f64 = 0.25;
const WEIGHT_SOH_CAPACITY: f64 = 0.20;
const WEIGHT_STABILITY: f64 = 0.10;
const WEIGHT_TEMPERATURE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub normalized_soh: f64,
    pub dcir_50_mohm: Option<f64>,
    pub dcir_20_mohm: Option<f64>,
    pub soh_capacity: f64,
    pub stability_score: f64,
    pub temperature_quality: f64,
}

/// Weighted blend of the individual health signals, 0-100.
pub fn composite_score(inputs: &ScoreInputs) -> f64 {
    let score = WEIGHT_NORMALIZED_SOH * inputs.normalized_soh.clamp(0.0, 100.0)
        + WEIGHT_DCIR * dcir_score(inputs.dcir_50_mohm, inputs.dcir_20_mohm)
        + WEIGHT_SOH_CAPACITY * inputs.soh_capacity.clamp(0.0, 100.0)
        + WEIGHT_STABILITY * inputs.stability_score.clamp(0.0, 100.0)
        + WEIGHT_TEMPERATURE * inputs.temperature_quality.clamp(0.0, 100.0);
    score.clamp(0.0, 100.0)
}

pub fn recommend(score: f64) -> Recommendation {
    Recommendation::for_score(score)
}

/// Resistance sub-score: full marks at or below the center, falling
/// linearly to zero at twice the center. Averaged when both SOC points are
/// present; with no resistance data at all the signal stays neutral at 100.
pub fn dcir_score(at_50: Option<f64>, at_20: Option<f64>) -> f64 {
    let s50 = at_50.map(|r| centered_penalty(r, DCIR_50_CENTER_MOHM));
    let s20 = at_20.map(|r| centered_penalty(r, DCIR_20_CENTER_MOHM));
    match (s50, s20) {
        (Some(a), Some(b)) => (a + b) / 2.0,
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => 100.0,
    }
}

fn centered_penalty(resistance_mohm: f64, center_mohm: f64) -> f64 {
    (100.0 - (resistance_mohm - center_mohm).max(0.0) / center_mohm * 100.0).clamp(0.0, 100.0)
}
