//! Adaptive neighborhoods for the per-point local fits.

use nalgebra::Point2;

/// Fit set and radius chosen for one calibration point.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Neighborhood {
    pub radius: f64,
    /// Indices of the fit set, the center included, in ascending order.
    pub members: Vec<usize>,
    /// True when fewer than `k + 1` other points existed and the radius was extrapolated.
    pub extrapolated: bool,
}

/// Neighborhood of `center` among `xy` for neighbor count `k` (`k ≥ 1`).
///
/// With `d[0] ≤ d[1] ≤ …` the sorted distances to the other points, the radius
/// is `(d[k-1] + d[k]) / 2` and the fit set is the center plus every other
/// point with `d ≤ d[k-1]`. Membership depends only on distances, so points
/// tied with the k-th nearest are all kept and input order never matters.
///
/// The fallback only applies when `xy.len()` is `k` or `k + 1`: the fit set is
/// every point and the radius is `1.5 ×` the farthest distance, as if `d[k]`
/// were twice `d[k-1]`.
pub(crate) fn adaptive_neighborhood(center: usize, xy: &[Point2<f64>], k: usize) -> Neighborhood {
    let origin = xy[center];
    let mut others: Vec<(usize, f64)> = xy
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != center)
        .map(|(j, p)| (j, (p - origin).norm()))
        .collect();
    others.sort_by(|a, b| a.1.total_cmp(&b.1));

    let (radius, cutoff, extrapolated) = if others.len() > k {
        (0.5 * (others[k - 1].1 + others[k].1), others[k - 1].1, false)
    } else {
        let farthest = others.last().map_or(0.0, |o| o.1);
        (1.5 * farthest, farthest, true)
    };

    let mut members: Vec<usize> = others
        .iter()
        .take_while(|o| o.1 <= cutoff)
        .map(|o| o.0)
        .collect();
    members.push(center);
    members.sort_unstable();

    Neighborhood {
        radius,
        members,
        extrapolated,
    }
}
