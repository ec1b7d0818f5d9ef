// Analysis layer - pure signal-processing over telemetry buffers
pub mod dcir;
pub mod energy;
pub mod microdrop;
pub mod ocv;
pub mod scoring;

/// Least-squares line through a set of (x, y) points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn value_at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least-squares fit. Returns `None` for fewer than two points or a
/// degenerate (zero-variance) x axis.
pub(crate) fn linear_fit(points: &[(f64, f64)]) -> Option<LinearFit> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }

    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < 1e-12 {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some(LinearFit { slope, intercept })
}

/// Sum of squared residuals of `points` against `fit`.
pub(crate) fn sum_squared_error(points: &[(f64, f64)], fit: &LinearFit) -> f64 {
    points
        .iter()
        .map(|(x, y)| {
            let r = y - fit.value_at(*x);
            r * r
        })
        .sum()
}
