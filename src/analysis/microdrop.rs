// Micro-drop detection - sudden charge drops not explained by steady discharge

use crate::domain::reading::Reading;

/// Minimum percentage-point fall that counts as a micro-drop.
const DROP_THRESHOLD_PCT: f64 = 2.0;
/// Largest window in which the fall must happen.
const DROP_WINDOW_SECS: f64 = 120.0;
/// SOC boundary splitting the statistics into bands.
const BAND_BOUNDARY_SOC: u8 = 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MicroDropStats {
    pub total: u32,
    pub above_20: u32,
    pub below_20: u32,
    pub rate_per_hour: f64,
    pub rate_above_20: f64,
    pub rate_below_20: f64,
    /// True when any qualifying drop happened at or above 20% SOC.
    pub unstable_under_load: bool,
}

/// Scan the buffer for micro-drop events: a >= 2-point SOC fall inside a
/// <= 120 s window while not charging. Each event is attributed to the band
/// the window started in, and a window that produced an event is skipped
/// past so one physical drop is counted exactly once. Rates use the total
/// non-charging time spent in each band.
pub fn analyze(samples: &[Reading]) -> MicroDropStats {
    let mut stats = MicroDropStats::default();

    let mut i = 0;
    while i < samples.len() {
        let start = &samples[i];
        if !start.discharging() {
            i += 1;
            continue;
        }

        // Furthest sample still inside the window.
        let mut j = i;
        while j + 1 < samples.len() {
            let dt = (samples[j + 1].timestamp - start.timestamp).num_milliseconds() as f64
                / 1000.0;
            if dt > DROP_WINDOW_SECS || !samples[j + 1].discharging() {
                break;
            }
            j += 1;
        }

        let drop = start.percentage as f64 - samples[j].percentage as f64;
        if j > i && drop >= DROP_THRESHOLD_PCT {
            stats.total += 1;
            if start.percentage >= BAND_BOUNDARY_SOC {
                stats.above_20 += 1;
                stats.unstable_under_load = true;
            } else {
                stats.below_20 += 1;
            }
            // Skip past the consumed window.
            i = j;
        } else {
            i += 1;
        }
    }

    let (hours_above, hours_below) = non_charging_hours(samples);
    stats.rate_above_20 = rate(stats.above_20, hours_above);
    stats.rate_below_20 = rate(stats.below_20, hours_below);
    stats.rate_per_hour = rate(stats.total, hours_above + hours_below);
    stats
}

fn rate(count: u32, hours: f64) -> f64 {
    if hours > 1e-9 {
        count as f64 / hours
    } else {
        0.0
    }
}

/// Non-charging duration split by the band each segment started in.
fn non_charging_hours(samples: &[Reading]) -> (f64, f64) {
    let mut above = 0.0;
    let mut below = 0.0;
    for pair in samples.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if !a.discharging() || !b.discharging() {
            continue;
        }
        let dt_h = (b.timestamp - a.timestamp).num_milliseconds() as f64 / 3_600_000.0;
        if dt_h <= 0.0 {
            continue;
        }
        if a.percentage >= BAND_BOUNDARY_SOC {
            above += dt_h;
        } else {
            below += dt_h;
        }
    }
    (above, below)
}

/// 0-100 stability from the drop counts; drops while the battery should
/// still be comfortable weigh three times as much as end-of-charge drops.
pub fn stability_score(stats: &MicroDropStats) -> f64 {
    let score =
        (100.0 - 15.0 * stats.above_20 as f64 - 5.0 * stats.below_20 as f64).clamp(0.0, 100.0);
    if stats.unstable_under_load {
        score.min(60.0)
    } else {
        score
    }
}
