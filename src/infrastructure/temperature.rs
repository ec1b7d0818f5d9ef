// Reference-temperature normalization model
//
// Chemistry delivers less energy and shows more resistance when cold, so
// raw figures measured away from the reference understate or overstate the
// battery's true condition. The coefficients are a first-order model, not a
// datasheet; quality falls off with distance from the reference either way.

use crate::engine::capabilities::{TemperatureAdjustment, TemperatureNormalizer};

/// Capacity deficit per degree below reference.
const SOH_COLD_COEFF_PER_C: f64 = 0.004;
/// Mild overstatement per degree above reference.
const SOH_HOT_COEFF_PER_C: f64 = 0.002;
/// Resistance inflation per degree below reference.
const DCIR_COLD_COEFF_PER_C: f64 = 0.01;
/// Quality lost per degree away from reference.
const QUALITY_LOSS_PER_C: f64 = 2.5;

#[derive(Debug, Clone)]
pub struct ReferenceNormalizer {
    pub reference_c: f64,
}

impl Default for ReferenceNormalizer {
    fn default() -> Self {
        Self { reference_c: 25.0 }
    }
}

impl TemperatureNormalizer for ReferenceNormalizer {
    fn normalize(
        &self,
        soh_energy: f64,
        dcir_at_50_mohm: Option<f64>,
        avg_temperature_c: f64,
    ) -> TemperatureAdjustment {
        let delta = avg_temperature_c - self.reference_c;

        let soh_factor = if delta < 0.0 {
            // Cold measurement under-reports capacity.
            (1.0 + SOH_COLD_COEFF_PER_C * -delta).min(1.2)
        } else {
            (1.0 - SOH_HOT_COEFF_PER_C * delta).max(0.9)
        };
        let normalized_soh = (soh_energy * soh_factor).clamp(0.0, 100.0);

        let normalized_dcir_50_mohm = dcir_at_50_mohm.map(|r| {
            if delta < 0.0 {
                r / (1.0 + DCIR_COLD_COEFF_PER_C * -delta)
            } else {
                r
            }
        });

        let quality_score = (100.0 - QUALITY_LOSS_PER_C * delta.abs()).clamp(0.0, 100.0);

        TemperatureAdjustment {
            normalized_soh,
            normalized_dcir_50_mohm,
            quality_score,
        }
    }
}
