//! Small dense solves used by the correction engine.
//!
//! Everything here is bounded-size (at most 6 unknowns), so the normal
//! equations are formed explicitly and solved with LU. Rank deficiency is
//! detected up front from the singular values of the normal matrix rather
//! than trusting LU pivots, which rarely hit exact zero in floating point.

use nalgebra::{DMatrix, DVector, Matrix6, Matrix6x3, Vector3, Vector6};

/// Number of terms in the local quadratic basis `[1, dx, dy, dx², dy², dx·dy]`.
pub const QUADRATIC_TERMS: usize = 6;

/// Smallest admissible ratio between the extreme singular values of a normal matrix.
const MIN_SINGULAR_RATIO: f64 = 1e-12;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinalgError {
    #[error("normal equations are singular or numerically rank deficient")]
    Singular,
    #[error("dimension mismatch: design has {rows} rows but {values} values were given")]
    DimensionMismatch { rows: usize, values: usize },
}

/// Quadratic basis evaluated at an offset `(dx, dy)`.
#[inline]
pub fn quadratic_basis(dx: f64, dy: f64) -> Vector6<f64> {
    Vector6::new(1.0, dx, dy, dx * dx, dy * dy, dx * dy)
}

/// Accumulated normal equations for a quadratic surface with a 3-vector target.
///
/// Each row contributes `b·bᵀ` to `AᵀA` and `b·tᵀ` to `AᵀT`, where `b` is the
/// quadratic basis at the row's offset. The three target components share the
/// design and are solved together.
#[derive(Clone, Debug)]
pub struct QuadraticNormalEquations {
    ata: Matrix6<f64>,
    atb: Matrix6x3<f64>,
    rows: usize,
}

impl Default for QuadraticNormalEquations {
    fn default() -> Self {
        Self::new()
    }
}

impl QuadraticNormalEquations {
    pub fn new() -> Self {
        Self {
            ata: Matrix6::zeros(),
            atb: Matrix6x3::zeros(),
            rows: 0,
        }
    }

    /// Add one design row at offset `(dx, dy)` observing `target`.
    pub fn add_row(&mut self, dx: f64, dy: f64, target: &Vector3<f64>) {
        let b = quadratic_basis(dx, dy);
        self.ata += b * b.transpose();
        self.atb += b * target.transpose();
        self.rows += 1;
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Solve for the coefficients; column `d` holds the fit for target dimension `d`.
    pub fn solve(&self) -> Result<Matrix6x3<f64>, LinalgError> {
        if self.rows < QUADRATIC_TERMS || !is_well_conditioned(&self.ata) {
            return Err(LinalgError::Singular);
        }
        let solution = self.ata.lu().solve(&self.atb).ok_or(LinalgError::Singular)?;
        if solution.iter().all(|v| v.is_finite()) {
            Ok(solution)
        } else {
            Err(LinalgError::Singular)
        }
    }
}

fn is_well_conditioned(normal: &Matrix6<f64>) -> bool {
    if !normal.iter().all(|v| v.is_finite()) {
        return false;
    }
    let sv = normal.singular_values();
    let max = sv.max();
    let min = sv.min();
    max > 0.0 && min > max * MIN_SINGULAR_RATIO
}

/// Weighted linear least squares `argmin Σ wᵢ (yᵢ − xᵢ·β)²` via the normal equations.
pub fn weighted_least_squares(
    design: &DMatrix<f64>,
    values: &DVector<f64>,
    weights: &DVector<f64>,
) -> Result<DVector<f64>, LinalgError> {
    let rows = design.nrows();
    if values.len() != rows || weights.len() != rows {
        return Err(LinalgError::DimensionMismatch {
            rows,
            values: values.len().min(weights.len()),
        });
    }

    let weighted = DMatrix::from_fn(rows, design.ncols(), |i, j| design[(i, j)] * weights[i]);
    let normal = design.transpose() * &weighted;
    let rhs = weighted.transpose() * values;

    if !normal.iter().all(|v| v.is_finite()) {
        return Err(LinalgError::Singular);
    }
    let sv = normal.singular_values();
    let max = sv.max();
    if max <= 0.0 || sv.min() <= max * MIN_SINGULAR_RATIO {
        return Err(LinalgError::Singular);
    }

    normal.lu().solve(&rhs).ok_or(LinalgError::Singular)
}

/// Diagonal of the hat matrix `X (XᵀX)⁻¹ Xᵀ`.
pub fn leverages(design: &DMatrix<f64>) -> Result<DVector<f64>, LinalgError> {
    let normal = design.transpose() * design;
    let inv = normal.try_inverse().ok_or(LinalgError::Singular)?;
    Ok(DVector::from_fn(design.nrows(), |i, _| {
        let row = design.row(i);
        (row * &inv).dot(&row)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn surface(x: f64, y: f64) -> Vector3<f64> {
        Vector3::new(
            0.5 + 0.1 * x - 0.2 * y + 0.01 * x * x,
            -1.0 + 0.03 * y * y + 0.02 * x * y,
            2.0 - 0.05 * x + 0.004 * x * x - 0.002 * y * y,
        )
    }

    #[test]
    fn recovers_exact_quadratic_surface() {
        let mut ne = QuadraticNormalEquations::new();
        for (dx, dy) in [
            (0.0, 0.0),
            (3.0, 1.0),
            (-2.0, 4.0),
            (5.0, -3.0),
            (-4.0, -1.0),
            (1.0, 6.0),
            (2.5, 2.5),
        ] {
            ne.add_row(dx, dy, &surface(dx, dy));
        }
        let coeffs = ne.solve().expect("well posed");
        for (dx, dy) in [(0.7, -0.3), (4.0, 4.0), (-3.5, 2.0)] {
            let b = quadratic_basis(dx, dy);
            let predicted = coeffs.transpose() * b;
            assert_relative_eq!(predicted, surface(dx, dy), epsilon = 1e-9);
        }
    }

    #[test]
    fn collinear_quadratic_design_is_singular() {
        // Two columns of the grid: dx² duplicates ±dx.
        let mut ne = QuadraticNormalEquations::new();
        for x in [0.0, 1.0] {
            for y in [0.0, 1.0, 2.0] {
                ne.add_row(x, y, &Vector3::new(x, y, 1.0));
            }
        }
        assert_eq!(ne.solve(), Err(LinalgError::Singular));
    }

    #[test]
    fn too_few_rows_is_singular() {
        let mut ne = QuadraticNormalEquations::new();
        for i in 0..5 {
            ne.add_row(i as f64, (i * i) as f64, &Vector3::zeros());
        }
        assert_eq!(ne.rows(), 5);
        assert_eq!(ne.solve(), Err(LinalgError::Singular));
    }

    #[test]
    fn weighted_fit_ignores_zero_weight_rows() {
        let design = DMatrix::from_row_slice(4, 2, &[0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0, 1.0]);
        let values = DVector::from_vec(vec![1.0, 3.0, 5.0, 100.0]);
        let weights = DVector::from_vec(vec![1.0, 1.0, 1.0, 0.0]);
        let beta = weighted_least_squares(&design, &values, &weights).expect("solvable");
        assert_relative_eq!(beta[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(beta[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn weighted_fit_rejects_mismatched_lengths() {
        let design = DMatrix::from_element(3, 1, 1.0);
        let values = DVector::from_element(2, 1.0);
        let weights = DVector::from_element(3, 1.0);
        assert!(matches!(
            weighted_least_squares(&design, &values, &weights),
            Err(LinalgError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn leverages_sum_to_parameter_count() {
        let design = DMatrix::from_row_slice(5, 2, &[0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 4.0, 1.0, 9.0, 1.0]);
        let h = leverages(&design).expect("full rank");
        assert_relative_eq!(h.sum(), 2.0, epsilon = 1e-12);
        assert!(h.iter().all(|&v| v > 0.0 && v < 1.0));
    }
}
