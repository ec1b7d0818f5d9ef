// Constant-power energy integration and SOH-by-energy

use crate::domain::reading::Reading;

/// Fallback pack OCV used for design-energy conversion when no curve was
/// reconstructed.
pub const FALLBACK_AVG_OCV_V: f64 = 11.1;
/// Sample gaps longer than this are not integrated; the controller was not
/// demonstrably holding power across them.
const MAX_INTEGRATION_GAP_SECS: f64 = 30.0;

/// Index span of samples collected under constant-power control,
/// inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpInterval {
    pub start: usize,
    pub end: usize,
}

/// What the constant-power window measured.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyAnalysis {
    pub energy_delivered_wh: f64,
    /// SOC percentage points covered by the CP intervals.
    pub collected_soc_span: f64,
    pub estimated_full_energy_wh: f64,
    pub soh_energy_percent: f64,
    pub avg_power_w: f64,
    /// 0-100; RMS deviation of sampled power from the CP target.
    pub power_control_quality: f64,
}

/// Integrate power over the CP intervals and scale the delivered energy up
/// to a full-charge equivalent. Only genuinely CP-controlled samples count.
pub fn analyze(
    samples: &[Reading],
    intervals: &[CpInterval],
    target_power_w: f64,
    design_capacity_mah: f64,
    avg_ocv_v: f64,
) -> EnergyAnalysis {
    let mut energy_wh = 0.0;
    let mut span = 0.0;
    let mut power_sum = 0.0;
    let mut dev_sq_sum = 0.0;
    let mut n_samples = 0usize;

    for iv in intervals {
        if iv.end <= iv.start || iv.end >= samples.len() {
            continue;
        }
        span += samples[iv.start].percentage as f64 - samples[iv.end].percentage as f64;

        for k in iv.start..iv.end {
            let (a, b) = (&samples[k], &samples[k + 1]);
            let dt_h = (b.timestamp - a.timestamp).num_milliseconds() as f64 / 3_600_000.0;
            if dt_h <= 0.0 || dt_h * 3600.0 > MAX_INTEGRATION_GAP_SECS {
                continue;
            }
            energy_wh += (a.power_w() + b.power_w()) / 2.0 * dt_h;
        }
        for k in iv.start..=iv.end {
            let p = samples[k].power_w();
            power_sum += p;
            dev_sq_sum += (p - target_power_w) * (p - target_power_w);
            n_samples += 1;
        }
    }

    let estimated_full_energy_wh = if span > 0.0 {
        energy_wh * 100.0 / span
    } else {
        0.0
    };
    let design_energy_wh = design_capacity_mah * avg_ocv_v / 1000.0;
    let soh_energy_percent = if design_energy_wh > 0.0 {
        (estimated_full_energy_wh / design_energy_wh * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let avg_power_w = if n_samples > 0 {
        power_sum / n_samples as f64
    } else {
        0.0
    };
    let power_control_quality = if n_samples > 0 && target_power_w > 0.0 {
        let rms = (dev_sq_sum / n_samples as f64).sqrt();
        (100.0 - (rms / target_power_w * 250.0).min(100.0)).max(0.0)
    } else {
        0.0
    };

    EnergyAnalysis {
        energy_delivered_wh: energy_wh,
        collected_soc_span: span,
        estimated_full_energy_wh,
        soh_energy_percent,
        avg_power_w,
        power_control_quality,
    }
}
