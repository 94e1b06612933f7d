//! Small numeric helpers for trend analysis and prediction.

use serde::{Deserialize, Serialize};

/// Least-squares fit of `y = slope·x + intercept` over sample indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    /// Change per sample.
    pub slope: f64,
    /// Value at index zero.
    pub intercept: f64,
    /// Coefficient of determination in [0, 1].
    pub r_squared: f64,
}

impl Regression {
    /// Extrapolate the fit to sample index `x`.
    #[must_use]
    pub fn predict(&self, x: f64) -> f64 {
        self.slope.mul_add(x, self.intercept)
    }
}

/// Direction of a utilization series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Slope above tolerance.
    Increasing,
    /// Slope below negative tolerance.
    Decreasing,
    /// Flat within tolerance.
    #[default]
    Stable,
}

/// Fit a line through `values` using their index as `x`.
///
/// Returns `None` with fewer than two samples. A perfectly flat series has an
/// `r_squared` of 1.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn linear_regression(values: &[f64]) -> Option<Regression> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = slope.mul_add(-mean_x, mean_y);

    let mut ss_tot = 0.0;
    let mut ss_res = 0.0;
    for (i, y) in values.iter().enumerate() {
        let fitted = slope.mul_add(i as f64, intercept);
        ss_tot += (y - mean_y).powi(2);
        ss_res += (y - fitted).powi(2);
    }
    let r_squared = if ss_tot > f64::EPSILON {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    } else {
        1.0
    };

    Some(Regression {
        slope,
        intercept,
        r_squared,
    })
}

/// Classify a slope against a symmetric tolerance.
#[must_use]
pub fn classify_trend(slope: f64, tolerance: f64) -> Trend {
    if slope > tolerance {
        Trend::Increasing
    } else if slope < -tolerance {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Weighted sum of the most recent consecutive deltas, newest first.
///
/// `weights[0]` applies to the newest delta. Returns `None` with fewer than two
/// samples.
#[must_use]
pub fn weighted_recent_delta(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let deltas = values.windows(2).rev().map(|w| w[1] - w[0]);
    Some(deltas.zip(weights).map(|(d, w)| d * w).sum())
}
