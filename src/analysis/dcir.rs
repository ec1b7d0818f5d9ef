// DC internal resistance estimation - Ohm's law across a load pulse

use crate::domain::reading::Reading;
use crate::domain::records::DcirPoint;

use super::linear_fit;

/// Smallest current step that counts as a measurable load transition.
pub const MIN_DELTA_CURRENT_MA: f64 = 1.0;
/// Sanity bounds on a single resistance estimate, exclusive.
pub const MAX_RESISTANCE_MOHM: f64 = 10_000.0;

/// Aggregate view over the resistance points collected during a test.
#[derive(Debug, Clone, PartialEq)]
pub struct DcirAnalysis {
    pub resistance_at_50_mohm: f64,
    pub resistance_at_20_mohm: f64,
    /// Slope of resistance vs. SOC; negative when resistance grows as the
    /// battery empties.
    pub trend_mohm_per_pct: Option<f64>,
    /// 0-100, penalized for high absolute resistance and steep trend.
    pub degradation_score: f64,
}

#[derive(Debug, Clone, Copy)]
struct SideAverage {
    voltage_v: f64,
    current_ma: f64,
    soc: f64,
}

fn average_side<'a>(samples: impl Iterator<Item = &'a Reading>) -> Option<SideAverage> {
    let mut n = 0usize;
    let (mut v, mut i, mut soc) = (0.0, 0.0, 0.0);
    for s in samples {
        v += s.voltage_v;
        i += s.current_ma;
        soc += s.percentage as f64;
        n += 1;
    }
    // A one-sample average is too noisy to trust.
    if n < 2 {
        return None;
    }
    let n = n as f64;
    Some(SideAverage {
        voltage_v: v / n,
        current_ma: i / n,
        soc: soc / n,
    })
}

/// Estimate internal resistance from the load transition at `pulse_start`.
///
/// Averages voltage, current and SOC over at most `window_secs` seconds on
/// each side of the transition and applies Ohm's law to the deltas. Returns
/// `None` when the transition is too small or the ratio is out of range;
/// per the rejection policy a bad pulse is dropped, never an error.
pub fn estimate(samples: &[Reading], pulse_start: usize, window_secs: f64) -> Option<DcirPoint> {
    if pulse_start == 0 || pulse_start >= samples.len() {
        return None;
    }

    let transition_at = samples[pulse_start].timestamp;
    let in_window = |r: &&Reading| {
        let dt = (transition_at - r.timestamp).num_milliseconds().abs() as f64 / 1000.0;
        dt <= window_secs
    };

    let before = average_side(samples[..pulse_start].iter().filter(in_window))?;
    let after = average_side(samples[pulse_start..].iter().filter(in_window))?;

    let delta_i_ma = after.current_ma - before.current_ma;
    if delta_i_ma.abs() < MIN_DELTA_CURRENT_MA {
        tracing::warn!(
            delta_i_ma,
            "rejecting DCIR measurement: no measurable load change"
        );
        return None;
    }

    // Voltage drops under load, so before - after is positive on a
    // well-formed pulse. The current delta is taken as a magnitude; its
    // sign only says whether the pulse started or ended here.
    let delta_v = before.voltage_v - after.voltage_v;
    let resistance_mohm = delta_v / (delta_i_ma.abs() / 1000.0) * 1000.0;
    if resistance_mohm <= 0.0 || resistance_mohm >= MAX_RESISTANCE_MOHM {
        tracing::warn!(resistance_mohm, "rejecting DCIR measurement: out of range");
        return None;
    }

    Some(DcirPoint {
        soc_percent: (before.soc + after.soc) / 2.0,
        resistance_mohm,
        timestamp: transition_at,
        quality: quality_score(delta_i_ma, delta_v, (before.soc - after.soc).abs()),
    })
}

/// Larger current/voltage swings make a cleaner measurement; SOC drift
/// during the window degrades it.
fn quality_score(delta_i_ma: f64, delta_v: f64, soc_drift: f64) -> f64 {
    let current_term = (delta_i_ma.abs() / 500.0).min(1.0) * 60.0;
    let voltage_term = (delta_v.abs() / 0.3).min(1.0) * 40.0;
    (current_term + voltage_term - soc_drift * 15.0).clamp(0.0, 100.0)
}

/// Interpolate/aggregate the collected points into a degradation analysis.
/// Returns `None` when no points were collected.
pub fn analyze(points: &[DcirPoint]) -> Option<DcirAnalysis> {
    if points.is_empty() {
        return None;
    }

    let mut sorted: Vec<&DcirPoint> = points.iter().collect();
    sorted.sort_by(|a, b| b.soc_percent.total_cmp(&a.soc_percent));

    let at_50 = interpolate_at(&sorted, 50.0);
    let at_20 = interpolate_at(&sorted, 20.0);

    let xy: Vec<(f64, f64)> = sorted
        .iter()
        .map(|p| (p.soc_percent, p.resistance_mohm))
        .collect();
    let trend = linear_fit(&xy).map(|f| f.slope);

    Some(DcirAnalysis {
        resistance_at_50_mohm: at_50,
        resistance_at_20_mohm: at_20,
        trend_mohm_per_pct: trend,
        degradation_score: degradation_score(at_50, at_20, trend),
    })
}

/// Linear interpolation over points sorted by descending SOC; outside the
/// observed range the nearest point's value is used.
fn interpolate_at(sorted_desc: &[&DcirPoint], target_soc: f64) -> f64 {
    let first = sorted_desc[0];
    let last = sorted_desc[sorted_desc.len() - 1];
    if target_soc >= first.soc_percent {
        return first.resistance_mohm;
    }
    if target_soc <= last.soc_percent {
        return last.resistance_mohm;
    }

    for pair in sorted_desc.windows(2) {
        let (hi, lo) = (pair[0], pair[1]);
        if target_soc <= hi.soc_percent && target_soc >= lo.soc_percent {
            let span = hi.soc_percent - lo.soc_percent;
            if span.abs() < 1e-9 {
                return (hi.resistance_mohm + lo.resistance_mohm) / 2.0;
            }
            let t = (target_soc - lo.soc_percent) / span;
            return lo.resistance_mohm + t * (hi.resistance_mohm - lo.resistance_mohm);
        }
    }
    last.resistance_mohm
}

fn degradation_score(at_50: f64, at_20: f64, trend: Option<f64>) -> f64 {
    let mut score = 100.0;
    if at_50 > 100.0 {
        score -= (at_50 - 100.0) * 0.3;
    }
    if at_20 > 200.0 {
        score -= (at_20 - 200.0) * 0.15;
    }
    // Resistance climbing steeply toward empty shows up as a strongly
    // negative slope.
    if let Some(slope) = trend {
        if slope < -1.0 {
            score -= (slope.abs() - 1.0) * 10.0;
        }
    }
    score.clamp(0.0, 100.0)
}
