// Open-circuit voltage reconstruction and knee detection

use chrono::{DateTime, TimeZone, Utc};

use crate::domain::reading::Reading;
use crate::domain::records::{DcirPoint, OcvPoint};

use super::{linear_fit, sum_squared_error};

/// Default SOC bin width for curve building.
pub const DEFAULT_BIN_PERCENT: f64 = 2.0;
/// Minimum curve points before a knee search is meaningful.
const MIN_KNEE_POINTS: usize = 8;
/// Knee candidates are only considered inside this SOC range.
const KNEE_SEARCH_MIN_SOC: f64 = 10.0;
const KNEE_SEARCH_MAX_SOC: f64 = 90.0;
/// Weight of the slope-change term when scoring a split candidate.
const SLOPE_CHANGE_WEIGHT: f64 = 0.001;

/// Where the OCV curve bends, and how healthy that location is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KneeResult {
    pub knee_soc: f64,
    /// 0-100; near 100 when the knee sits in the healthy low-SOC band.
    pub knee_index: f64,
}

/// Reconstructs open-circuit voltage using a known resistance curve for
/// load compensation.
#[derive(Debug, Clone)]
pub struct OcvAnalyzer {
    resistance_curve: Vec<DcirPoint>,
    /// SOC where a knee is considered perfectly healthy.
    knee_healthy_soc: f64,
    /// SOC distance over which the knee index decays from 100 to 0.
    knee_scoring_span: f64,
}

impl OcvAnalyzer {
    pub fn new(mut resistance_curve: Vec<DcirPoint>) -> Self {
        resistance_curve.sort_by(|a, b| a.soc_percent.total_cmp(&b.soc_percent));
        Self {
            resistance_curve,
            knee_healthy_soc: 20.0,
            knee_scoring_span: 30.0,
        }
    }

    pub fn with_knee_scoring(mut self, healthy_soc: f64, span: f64) -> Self {
        self.knee_healthy_soc = healthy_soc;
        self.knee_scoring_span = span.max(1e-6);
        self
    }

    /// Compensate a measured voltage for load-induced drop. Discharge
    /// current is negative, so subtracting I*R raises the voltage back
    /// toward true OCV. Without resistance data the raw voltage is used.
    pub fn reconstruct(&self, sample: &Reading) -> f64 {
        match self.resistance_at(sample.percentage as f64) {
            Some(r_mohm) => sample.voltage_v - sample.current_a() * (r_mohm / 1000.0),
            None => sample.voltage_v,
        }
    }

    fn resistance_at(&self, soc: f64) -> Option<f64> {
        let curve = &self.resistance_curve;
        match curve.as_slice() {
            [] => None,
            [only] => Some(only.resistance_mohm),
            _ => {
                let first = &curve[0];
                let last = &curve[curve.len() - 1];
                if soc <= first.soc_percent {
                    return Some(first.resistance_mohm);
                }
                if soc >= last.soc_percent {
                    return Some(last.resistance_mohm);
                }
                for pair in curve.windows(2) {
                    let (lo, hi) = (&pair[0], &pair[1]);
                    if soc >= lo.soc_percent && soc <= hi.soc_percent {
                        let span = hi.soc_percent - lo.soc_percent;
                        if span.abs() < 1e-9 {
                            return Some((lo.resistance_mohm + hi.resistance_mohm) / 2.0);
                        }
                        let t = (soc - lo.soc_percent) / span;
                        return Some(
                            lo.resistance_mohm + t * (hi.resistance_mohm - lo.resistance_mohm),
                        );
                    }
                }
                Some(last.resistance_mohm)
            }
        }
    }

    /// Bin reconstructed OCV by SOC, averaging voltage and timestamp per
    /// bin. Returns bins sorted ascending by SOC (bin centers).
    pub fn build_curve(&self, samples: &[Reading], bin_size_percent: f64) -> Vec<OcvPoint> {
        let bin = bin_size_percent.max(0.1);
        let mut bins: std::collections::BTreeMap<i64, (f64, i64, usize)> =
            std::collections::BTreeMap::new();

        for s in samples {
            if !s.discharging() {
                continue;
            }
            let idx = (s.percentage as f64 / bin).floor() as i64;
            let entry = bins.entry(idx).or_insert((0.0, 0, 0));
            entry.0 += self.reconstruct(s);
            entry.1 += s.timestamp.timestamp_millis();
            entry.2 += 1;
        }

        bins.into_iter()
            .map(|(idx, (v_sum, t_sum, n))| {
                let n_f = n as f64;
                OcvPoint {
                    soc_percent: idx as f64 * bin + bin / 2.0,
                    ocv_voltage: v_sum / n_f,
                    timestamp: average_timestamp(t_sum, n),
                }
            })
            .collect()
    }

    /// Two-segment least-squares search for the knee of the OCV curve.
    ///
    /// Every interior split with SOC in the search range gets scored by the
    /// combined residual of independent left/right line fits plus a small
    /// term favoring a genuine slope change; the minimum wins.
    pub fn find_knee(&self, curve: &[OcvPoint]) -> Option<KneeResult> {
        if curve.len() < MIN_KNEE_POINTS {
            return None;
        }

        let xy: Vec<(f64, f64)> = curve.iter().map(|p| (p.soc_percent, p.ocv_voltage)).collect();

        let mut best: Option<(f64, f64)> = None; // (score, knee_soc)
        for split in 2..curve.len() - 2 {
            let soc = curve[split].soc_percent;
            if !(KNEE_SEARCH_MIN_SOC..=KNEE_SEARCH_MAX_SOC).contains(&soc) {
                continue;
            }

            let (left, right) = (&xy[..=split], &xy[split..]);
            let (Some(fit_l), Some(fit_r)) = (linear_fit(left), linear_fit(right)) else {
                continue;
            };
            let score = sum_squared_error(left, &fit_l)
                + sum_squared_error(right, &fit_r)
                + SLOPE_CHANGE_WEIGHT * (fit_l.slope - fit_r.slope).abs();

            if best.is_none_or(|(s, _)| score < s) {
                best = Some((score, soc));
            }
        }

        best.map(|(_, knee_soc)| KneeResult {
            knee_soc,
            knee_index: self.knee_index(knee_soc),
        })
    }

    /// A knee near the healthy band scores near 100; one drifting toward
    /// mid-SOC scores near 0. The band is a tunable, not a physical law.
    fn knee_index(&self, knee_soc: f64) -> f64 {
        let t = ((knee_soc - self.knee_healthy_soc) / self.knee_scoring_span).clamp(0.0, 1.0);
        (1.0 - t) * 100.0
    }
}

fn average_timestamp(millis_sum: i64, n: usize) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis_sum / n as i64)
        .single()
        .unwrap_or_else(Utc::now)
}
