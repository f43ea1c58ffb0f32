//! Bisquare (Tukey biweight) robust line fitting.
//!
//! Iteratively reweighted least squares: residuals are adjusted for leverage,
//! scaled by a MAD estimate of sigma, and mapped through the bisquare weight
//! `(1 − u²)²` (zero for `|u| ≥ 1`), so gross outliers stop pulling the line.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::linalg::{leverages, weighted_least_squares, LinalgError};

/// Consistency constant turning a MAD into a Gaussian sigma estimate.
const MAD_TO_SIGMA: f64 = 0.6745;
/// Leverages are clamped below one so adjusted residuals stay finite.
const MAX_LEVERAGE: f64 = 0.9999;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RobustFitError {
    #[error("need at least {required} samples for a line fit, got {got}")]
    InsufficientData { got: usize, required: usize },
    #[error("x and y lengths differ ({x} vs {y})")]
    LengthMismatch { x: usize, y: usize },
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// `y = slope · x + intercept`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LineFit {
    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BisquareParams {
    /// Bisquare tuning constant (95 % Gaussian efficiency at 4.685).
    pub tuning: f64,
    pub max_iters: usize,
    /// Relative change of the coefficients below which iteration stops.
    pub tolerance: f64,
    /// When false the line is forced through the origin.
    pub fit_intercept: bool,
}

impl Default for BisquareParams {
    fn default() -> Self {
        Self {
            tuning: 4.685,
            max_iters: 50,
            tolerance: 1e-10,
            fit_intercept: true,
        }
    }
}

/// Median of a slice (mean of the two middle values for even lengths).
///
/// Returns `None` for an empty slice. NaNs sort last.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    })
}

#[inline]
fn bisquare_weight(u: f64) -> f64 {
    if u.abs() < 1.0 {
        let t = 1.0 - u * u;
        t * t
    } else {
        0.0
    }
}

/// Robustly fit `y ≈ slope · x + intercept`.
///
/// With `fit_intercept == false` the returned intercept is exactly `0.0`.
pub fn bisquare_line_fit(
    x: &[f64],
    y: &[f64],
    params: &BisquareParams,
) -> Result<LineFit, RobustFitError> {
    if x.len() != y.len() {
        return Err(RobustFitError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        });
    }
    let n = x.len();
    let p = if params.fit_intercept { 2 } else { 1 };
    if n < p {
        return Err(RobustFitError::InsufficientData {
            got: n,
            required: p,
        });
    }

    let design = DMatrix::from_fn(n, p, |i, j| if j == 0 { x[i] } else { 1.0 });
    let values = DVector::from_column_slice(y);
    let h = leverages(&design)?;
    let adjust = h.map(|hi| 1.0 / (1.0 - hi.min(MAX_LEVERAGE)).sqrt());

    let mut weights = DVector::from_element(n, 1.0);
    let mut beta = weighted_least_squares(&design, &values, &weights)?;

    for iter in 0..params.max_iters {
        let residuals = &values - &design * &beta;
        let adjusted: Vec<f64> = residuals
            .iter()
            .zip(adjust.iter())
            .map(|(r, a)| r * a)
            .collect();
        let abs_adjusted: Vec<f64> = adjusted.iter().map(|r| r.abs()).collect();
        let sigma = median(&abs_adjusted).unwrap_or(0.0) / MAD_TO_SIGMA;

        let scale = values.amax().max(1.0);
        if sigma <= 1e-12 * scale {
            log::trace!("bisquare fit exact after {iter} iterations");
            break;
        }

        let cutoff = params.tuning * sigma;
        weights = DVector::from_iterator(n, adjusted.iter().map(|r| bisquare_weight(r / cutoff)));

        let next = weighted_least_squares(&design, &values, &weights)?;
        let change = (&next - &beta).amax();
        let size = next.amax().max(beta.amax()).max(f64::MIN_POSITIVE);
        beta = next;
        if change <= params.tolerance * size {
            log::trace!("bisquare fit converged after {} iterations", iter + 1);
            break;
        }
    }

    Ok(LineFit {
        slope: beta[0],
        intercept: if params.fit_intercept { beta[1] } else { 0.0 },
    })
}
