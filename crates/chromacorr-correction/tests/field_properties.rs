use approx::assert_relative_eq;
use chromacorr_correction::{
    build, correction_from_xml, correction_to_xml, leave_one_out_tre, read_correction_file,
    write_correction_file, CalibrationPoint, ChannelPair, CorrectionBuilder, CorrectionError,
    CorrectionField, PhysicalScale, TreEstimator,
};
use nalgebra::{Point3, Vector3};

const SCALE: PhysicalScale = PhysicalScale::new(80.0, 100.0);

/// Smooth quadratic aberration over a 256 px field of view (pixels).
fn aberration(x: f64, y: f64) -> Vector3<f64> {
    Vector3::new(
        0.3 + 1e-3 * x + 2e-6 * x * x,
        -0.2 + 1.5e-3 * y - 3e-6 * y * y,
        0.5 + 1e-3 * x - 5e-4 * y + 1e-6 * x * y,
    )
}

/// Deterministic stand-in for localization noise, about ±0.05 px.
fn jitter(k: usize) -> Vector3<f64> {
    let t = k as f64;
    Vector3::new(
        0.05 * (12.9898 * t + 0.3).sin(),
        0.05 * (78.233 * t + 1.1).sin(),
        0.05 * (37.719 * t + 2.7).sin(),
    )
}

/// An 8×8 grid at 30 px spacing, each point displaced by a few pixels.
fn calibration_grid(noise: bool) -> Vec<CalibrationPoint> {
    (0..64)
        .map(|k| {
            let (i, j) = (k % 8, k / 8);
            let x = 20.0 + 30.0 * i as f64 + 3.0 * (1.7 * k as f64).sin();
            let y = 20.0 + 30.0 * j as f64 + 3.0 * (2.3 * k as f64).cos();
            let reference = Point3::new(x, y, 10.0 + 0.1 * i as f64);
            let mut shift = aberration(x, y);
            if noise {
                shift += jitter(k);
            }
            CalibrationPoint::from_positions(k as u32, &[reference, reference + shift])
        })
        .collect()
}

fn noisy_field() -> CorrectionField {
    build(&calibration_grid(true), 0, 1, 16).expect("build")
}

#[test]
fn reproduces_an_injected_quadratic_aberration() {
    let points = calibration_grid(false);
    let field = build(&points, 0, 1, 16).expect("build");
    assert_eq!(field.len(), 64);

    for (x, y) in [(47.3, 61.8), (120.0, 130.0), (200.5, 88.25), (75.0, 190.0)] {
        let c = field.correct(x, y).expect("covered");
        let expected = aberration(x, y);
        assert!(
            (c - expected).amax() < 0.01,
            "({x}, {y}): {c:?} vs {expected:?}"
        );
    }

    let report = leave_one_out_tre(&points, 0, 1, 16, SCALE).expect("tre");
    assert_eq!(report.succeeded, 64);
    assert!(report.tre_3d < 2.0, "tre 3d {}", report.tre_3d);
    assert!(report.tre_2d <= report.tre_3d);
}

#[test]
fn queries_inside_the_hull_are_covered() {
    let field = noisy_field();
    // The jittered grid's hull contains [25, 225]².
    for i in 0..=40 {
        for j in 0..=40 {
            let x = 25.0 + 5.0 * i as f64;
            let y = 25.0 + 5.0 * j as f64;
            let c = field
                .correct(x, y)
                .unwrap_or_else(|e| panic!("({x}, {y}) not covered: {e}"));
            assert!(c.iter().all(|v| v.is_finite()));
        }
    }
}

#[test]
fn field_is_continuous_across_radius_boundaries() {
    let field = noisy_field();
    let y = 101.3;
    let step = 0.002;
    let mut previous = field.correct(25.0, y).expect("covered");
    let mut x = 25.0;
    while x < 225.0 {
        x += step;
        let current = field.correct(x, y).expect("covered");
        assert!(
            (current - previous).amax() < 1e-3,
            "jump of {} at x = {x}",
            (current - previous).amax()
        );
        previous = current;
    }

    // Straddle one point's boundary directly.
    let local = &field.locals()[27];
    let edge = local.position.x + local.radius;
    if edge < 225.0 {
        let h = 1e-7;
        let inside = field.correct(edge - h, local.position.y).expect("covered");
        let outside = field.correct(edge + h, local.position.y).expect("covered");
        assert!((inside - outside).amax() < 1e-5);
    }
}

#[test]
fn uncovered_query_carries_its_coordinates() {
    let field = noisy_field();
    assert_eq!(
        field.correct(5000.0, -4000.0),
        Err(CorrectionError::UnableToCorrect {
            x: 5000.0,
            y: -4000.0
        })
    );
}

#[test]
fn correction_file_round_trip_is_exact() {
    let field = noisy_field();
    let xml = correction_to_xml(&field).expect("xml");
    let reloaded = correction_from_xml(&xml).expect("reload");
    assert_eq!(correction_to_xml(&reloaded).expect("xml"), xml);
    assert_eq!(reloaded.correct(111.0, 97.0), field.correct(111.0, 97.0));

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("20250301_correction.xml");
    write_correction_file(&field, &path).expect("write");
    let from_disk = read_correction_file(&path).expect("read");
    assert_eq!(from_disk, field);
    assert_eq!(std::fs::read_to_string(&path).expect("read"), xml);
}

#[test]
fn tre_does_not_depend_on_input_order() {
    let points = calibration_grid(true);
    let forward = leave_one_out_tre(&points, 0, 1, 16, SCALE).expect("tre");

    let mut reversed = points.clone();
    reversed.reverse();
    let backward = leave_one_out_tre(&reversed, 0, 1, 16, SCALE).expect("tre");

    let mut rotated = points.clone();
    rotated.rotate_left(23);
    let shifted = leave_one_out_tre(&rotated, 0, 1, 16, SCALE).expect("tre");

    for other in [&backward, &shifted] {
        assert_eq!(other.succeeded, forward.succeeded);
        assert_relative_eq!(other.tre_3d, forward.tre_3d, epsilon = 1e-9);
        assert_relative_eq!(other.tre_2d, forward.tre_2d, epsilon = 1e-9);
    }
    assert!(forward.tre_3d > 0.0);
}

/// Exact 8×8 grid at 30 px spacing: many neighbor distances tie.
fn regular_grid() -> Vec<CalibrationPoint> {
    (0..64)
        .map(|k| {
            let x = 20.0 + 30.0 * (k % 8) as f64;
            let y = 20.0 + 30.0 * (k / 8) as f64;
            let reference = Point3::new(x, y, 10.0);
            let target = reference + aberration(x, y) + jitter(k);
            CalibrationPoint::from_positions(k as u32, &[reference, target])
        })
        .collect()
}

#[test]
fn tre_on_a_regular_grid_does_not_depend_on_input_order() {
    let points = regular_grid();
    let mut reversed = points.clone();
    reversed.reverse();
    let mut rotated = points.clone();
    rotated.rotate_left(19);

    for k in [10, 12] {
        let forward = leave_one_out_tre(&points, 0, 1, k, SCALE).expect("tre");
        assert_eq!(forward.succeeded, 64, "k = {k}");
        for other in [&reversed, &rotated] {
            let report = leave_one_out_tre(other, 0, 1, k, SCALE).expect("tre");
            assert_eq!(report.succeeded, forward.succeeded, "k = {k}");
            assert_relative_eq!(report.tre_3d, forward.tre_3d, epsilon = 1e-9);
            assert_relative_eq!(report.tre_2d, forward.tre_2d, epsilon = 1e-9);
        }
    }
}

#[test]
fn regular_grid_field_does_not_depend_on_input_order() {
    let points = regular_grid();
    let mut reversed = points.clone();
    reversed.reverse();
    let forward = build(&points, 0, 1, 10).expect("build");
    let backward = build(&reversed, 0, 1, 10).expect("build");
    for local in forward.locals() {
        let twin = backward
            .locals()
            .iter()
            .find(|l| l.label == local.label)
            .expect("same labels");
        assert_eq!(twin.radius, local.radius);
    }
    for (x, y) in [(35.0, 35.0), (110.0, 95.0), (200.0, 41.0)] {
        let a = forward.correct(x, y).expect("covered");
        let b = backward.correct(x, y).expect("covered");
        assert!((a - b).amax() < 1e-9, "({x}, {y}): {a:?} vs {b:?}");
    }
}

#[test]
fn worker_pool_matches_sequential_run() {
    let points = calibration_grid(true);
    let builder = CorrectionBuilder::new(ChannelPair::new(0, 1), 16);
    let sequential = TreEstimator::new(builder, SCALE).estimate(&points).expect("tre");
    let pooled = TreEstimator::new(builder, SCALE)
        .with_max_threads(4)
        .estimate(&points)
        .expect("tre");
    assert_eq!(pooled, sequential);
}
