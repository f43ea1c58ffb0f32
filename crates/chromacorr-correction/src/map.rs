//! Dense aberration maps over a pixel rectangle.

use std::ops::Range;

use chromacorr_core::PhysicalScale;
use nalgebra::Vector3;
use serde::Serialize;

use crate::error::CorrectionError;
use crate::field::CorrectionField;

/// Field correction sampled at every integer pixel of a rectangle, in nm.
///
/// Cells are stored row-major; `None` marks pixels no calibration point covers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AberrationMap {
    pub x0: i32,
    pub y0: i32,
    pub width: usize,
    pub height: usize,
    pub cells: Vec<Option<Vector3<f64>>>, // len = width * height
}

impl AberrationMap {
    /// Correction at pixel `(x, y)`; outer `None` when outside the rectangle.
    pub fn get(&self, x: i32, y: i32) -> Option<Option<Vector3<f64>>> {
        let col = usize::try_from(x.checked_sub(self.x0)?).ok()?;
        let row = usize::try_from(y.checked_sub(self.y0)?).ok()?;
        if col >= self.width || row >= self.height {
            return None;
        }
        Some(self.cells[row * self.width + col])
    }

    /// One output dimension (0 = x, 1 = y, 2 = z) as a row-major plane.
    pub fn plane(&self, dimension: usize) -> Vec<Option<f64>> {
        self.cells
            .iter()
            .map(|c| c.map(|v| v[dimension]))
            .collect()
    }

    pub fn covered(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }
}

/// Evaluate `field` at every pixel of `xs × ys` and convert to physical units.
///
/// Empty ranges give an empty map.
pub fn aberration_map(
    field: &CorrectionField,
    xs: Range<i32>,
    ys: Range<i32>,
    scale: &PhysicalScale,
) -> AberrationMap {
    let width = xs.len();
    let height = ys.len();
    let mut cells = Vec::with_capacity(width * height);
    for y in ys.clone() {
        for x in xs.clone() {
            let cell = match field.correct(f64::from(x), f64::from(y)) {
                Ok(v) => Some(scale.to_physical(&v)),
                Err(CorrectionError::UnableToCorrect { .. }) => None,
                Err(err) => {
                    log::warn!("aberration map cell ({x}, {y}) failed: {err}");
                    None
                }
            };
            cells.push(cell);
        }
    }

    let map = AberrationMap {
        x0: xs.start,
        y0: ys.start,
        width,
        height,
        cells,
    };
    log::debug!(
        "aberration map {}x{}: {} of {} cells covered",
        width,
        height,
        map.covered(),
        map.cells.len()
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use approx::assert_relative_eq;
    use chromacorr_core::CalibrationPoint;
    use nalgebra::Point3;

    fn shift(x: f64, y: f64) -> Vector3<f64> {
        Vector3::new(0.5 + 0.01 * x, -0.25 + 0.02 * y, 0.1 * x - 0.05 * y)
    }

    fn field() -> CorrectionField {
        let points: Vec<CalibrationPoint> = (0..36)
            .map(|k| {
                let x = 10.0 * (k % 6) as f64 + 0.7 * (1.3 * k as f64).sin();
                let y = 10.0 * (k / 6) as f64 + 0.7 * (2.1 * k as f64).cos();
                let reference = Point3::new(x, y, 0.0);
                CalibrationPoint::from_positions(k as u32, &[reference, reference + shift(x, y)])
            })
            .collect();
        build(&points, 0, 1, 8).expect("build")
    }

    #[test]
    fn covered_cells_are_scaled_to_nm() {
        let scale = PhysicalScale::new(80.0, 100.0);
        let map = aberration_map(&field(), 10..20, 5..12, &scale);
        assert_eq!((map.width, map.height), (10, 7));
        assert_eq!(map.cells.len(), 70);
        assert_eq!(map.covered(), 70);

        let v = map.get(13, 8).expect("inside").expect("covered");
        let want = shift(13.0, 8.0);
        assert_relative_eq!(v.x, 80.0 * want.x, epsilon = 1e-6);
        assert_relative_eq!(v.y, 80.0 * want.y, epsilon = 1e-6);
        assert_relative_eq!(v.z, 100.0 * want.z, epsilon = 1e-6);

        let z = map.plane(2);
        assert_eq!(z[(8 - 5) * 10 + (13 - 10)], Some(v.z));
    }

    #[test]
    fn uncovered_cells_are_none_not_zero() {
        let map = aberration_map(&field(), 20..30, 1000..1003, &PhysicalScale::pixels());
        assert_eq!(map.covered(), 0);
        assert!(map.cells.iter().all(Option::is_none));
        assert_eq!(map.get(25, 1001), Some(None));
        assert_eq!(map.get(30, 1001), None);
        assert_eq!(map.get(19, 1001), None);
    }

    #[test]
    fn empty_bounds_give_an_empty_map() {
        let map = aberration_map(&field(), 5..5, 0..10, &PhysicalScale::pixels());
        assert_eq!(map.width, 0);
        assert!(map.cells.is_empty());
    }
}
