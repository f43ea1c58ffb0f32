//! Maximum-likelihood fit of the P3D distance distribution.
//!
//! If a 3D offset of true length `m` is observed with isotropic Gaussian noise
//! of width `s` per axis, the observed length `r` follows
//!
//! ```text
//! p(r; m, s) = sqrt(2/π) · r/(2ms) · (exp(−(m−r)²/2s²) − exp(−(m+r)²/2s²))
//! ```
//!
//! Fitting `(m, s)` to a set of post-correction distances separates the
//! residual systematic offset from localization noise.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum P3dFitError {
    #[error("no distances to fit")]
    EmptyData,
    #[error("distances must be finite and non-negative, and the likelihood finite at the optimum")]
    NonFinite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P3dFitOptions {
    /// Cap on the negative log-probability any single distance may contribute.
    #[serde(default)]
    pub robust_cutoff: Option<f64>,
    /// Hold `s` at this value and fit only `m`.
    #[serde(default)]
    pub fixed_s: Option<f64>,
    /// Relative spread of simplex values at which the search stops.
    pub tolerance: f64,
    pub max_iters: usize,
}

impl Default for P3dFitOptions {
    fn default() -> Self {
        Self {
            robust_cutoff: None,
            fixed_s: None,
            tolerance: 1e-12,
            max_iters: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct P3dFit {
    pub m: f64,
    pub s: f64,
    pub neg_log_likelihood: f64,
}

/// P3D probability density at `r`.
pub fn p3d_density(r: f64, m: f64, s: f64) -> f64 {
    let two_s2 = 2.0 * s * s;
    (2.0 / std::f64::consts::PI).sqrt() * r / (2.0 * m * s)
        * ((-(m - r).powi(2) / two_s2).exp() - (-(m + r).powi(2) / two_s2).exp())
}

/// `ln p(r; m, s)` without the underflow of the direct difference of exponentials.
fn p3d_log_density(r: f64, m: f64, s: f64) -> f64 {
    let s2 = s * s;
    0.5 * (2.0 / std::f64::consts::PI).ln() + r.ln()
        - (2.0 * m * s).ln()
        - (m - r).powi(2) / (2.0 * s2)
        + (-(-2.0 * m * r / s2).exp()).ln_1p()
}

fn neg_log_likelihood(distances: &[f64], m: f64, s: f64, cutoff: Option<f64>) -> f64 {
    if !(m > 0.0 && s > 0.0) {
        return f64::MAX;
    }
    let total: f64 = distances
        .iter()
        .map(|&r| {
            let nlp = -p3d_log_density(r, m, s);
            match cutoff {
                Some(c) if !(nlp <= c) => c,
                _ => nlp,
            }
        })
        .sum();
    if total.is_finite() {
        total
    } else {
        f64::MAX
    }
}

/// Fit `(m, s)` to non-negative distances by minimising the negative log-likelihood.
pub fn fit_p3d(distances: &[f64], options: &P3dFitOptions) -> Result<P3dFit, P3dFitError> {
    if distances.is_empty() {
        return Err(P3dFitError::EmptyData);
    }
    if distances.iter().any(|r| !r.is_finite() || *r < 0.0) {
        return Err(P3dFitError::NonFinite);
    }

    let n = distances.len() as f64;
    let mean = distances.iter().sum::<f64>() / n;
    let var = distances.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let spread = if var > 0.0 { var.sqrt() } else { 0.1 * mean };
    let cutoff = options.robust_cutoff;

    let (m, s, value) = match options.fixed_s {
        Some(s) => {
            let objective = |x: &[f64]| neg_log_likelihood(distances, x[0], s, cutoff);
            let (x, value) = nelder_mead(
                objective,
                &[mean],
                &[initial_step(mean)],
                options.tolerance,
                options.max_iters,
            );
            (x[0], s, value)
        }
        None => {
            let objective = |x: &[f64]| neg_log_likelihood(distances, x[0], x[1], cutoff);
            let (x, value) = nelder_mead(
                objective,
                &[mean, spread],
                &[initial_step(mean), initial_step(spread)],
                options.tolerance,
                options.max_iters,
            );
            (x[0], x[1], value)
        }
    };

    if value >= f64::MAX || !m.is_finite() || !s.is_finite() {
        return Err(P3dFitError::NonFinite);
    }
    log::debug!("p3d fit over {} distances: m = {m:.4}, s = {s:.4}", distances.len());
    Ok(P3dFit {
        m,
        s,
        neg_log_likelihood: value,
    })
}

fn initial_step(x: f64) -> f64 {
    if x.abs() > 0.0 {
        0.1 * x.abs()
    } else {
        0.05
    }
}

/// Downhill simplex minimisation of `f` starting at `start`.
///
/// Returns `(x_min, f_min)`.
fn nelder_mead(
    f: impl Fn(&[f64]) -> f64,
    start: &[f64],
    steps: &[f64],
    tolerance: f64,
    max_iters: usize,
) -> (Vec<f64>, f64) {
    const REFLECT: f64 = 1.0;
    const EXPAND: f64 = 2.0;
    const CONTRACT: f64 = 0.5;
    const SHRINK: f64 = 0.5;

    let dim = start.len();
    let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(dim + 1);
    simplex.push((start.to_vec(), f(start)));
    for (i, step) in steps.iter().enumerate() {
        let mut x = start.to_vec();
        x[i] += step;
        let fx = f(&x);
        simplex.push((x, fx));
    }

    // x = a + t (b − a)
    let along = |a: &[f64], b: &[f64], t: f64| -> Vec<f64> {
        a.iter().zip(b).map(|(ai, bi)| ai + t * (bi - ai)).collect()
    };

    for _ in 0..max_iters {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[dim].1;
        if (worst - best).abs() <= tolerance * (best.abs() + worst.abs()) {
            break;
        }

        let mut centroid = vec![0.0; dim];
        for (x, _) in &simplex[..dim] {
            for (c, xi) in centroid.iter_mut().zip(x) {
                *c += xi / dim as f64;
            }
        }

        let reflected = along(&centroid, &simplex[dim].0, -REFLECT);
        let f_reflected = f(&reflected);

        if f_reflected < best {
            let expanded = along(&centroid, &simplex[dim].0, -EXPAND);
            let f_expanded = f(&expanded);
            simplex[dim] = if f_expanded < f_reflected {
                (expanded, f_expanded)
            } else {
                (reflected, f_reflected)
            };
            continue;
        }
        if f_reflected < simplex[dim - 1].1 {
            simplex[dim] = (reflected, f_reflected);
            continue;
        }

        let (contracted, accept_below) = if f_reflected < worst {
            (along(&centroid, &reflected, CONTRACT), f_reflected)
        } else {
            (along(&centroid, &simplex[dim].0, CONTRACT), worst)
        };
        let f_contracted = f(&contracted);
        if f_contracted < accept_below {
            simplex[dim] = (contracted, f_contracted);
            continue;
        }

        let anchor = simplex[0].0.clone();
        for vertex in simplex.iter_mut().skip(1) {
            let x = along(&anchor, &vertex.0, SHRINK);
            let fx = f(&x);
            *vertex = (x, fx);
        }
    }

    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    let (x, value) = simplex.swap_remove(0);
    (x, value)
}
