//! Applying a correction field to experimental points.

use chromacorr_core::{CalibrationPoint, PhysicalScale};
use nalgebra::Vector3;
use serde::Serialize;

use crate::error::CorrectionError;
use crate::field::CorrectionField;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CorrectedPoint {
    /// The point with its correction channel moved by `-correction`.
    pub point: CalibrationPoint,
    /// Field value at the point (pixels).
    pub correction: Vector3<f64>,
    /// Channel difference after correction (pixels).
    pub difference: Vector3<f64>,
    /// 3D length of `difference` in physical units.
    pub distance: f64,
}

/// A point outside calibration coverage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UncorrectedPoint {
    pub label: u32,
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CorrectionOutcome {
    pub corrected: Vec<CorrectedPoint>,
    pub uncorrected: Vec<UncorrectedPoint>,
}

impl CorrectionOutcome {
    pub fn distances(&self) -> Vec<f64> {
        self.corrected.iter().map(|c| c.distance).collect()
    }

    pub fn points(&self) -> Vec<CalibrationPoint> {
        self.corrected.iter().map(|c| c.point.clone()).collect()
    }
}

/// Correct every point; uncovered points are reported and skipped.
///
/// A point missing either channel of the field is an error for the whole call.
pub fn apply_correction(
    field: &CorrectionField,
    points: &[CalibrationPoint],
    scale: &PhysicalScale,
) -> Result<CorrectionOutcome, CorrectionError> {
    let channels = field.channels();
    let mut outcome = CorrectionOutcome::default();

    for point in points {
        let missing = |channel| CorrectionError::MissingChannel {
            label: point.label(),
            channel,
        };
        let difference = point
            .difference(channels)
            .ok_or_else(|| match point.channel(channels.reference) {
                None => missing(channels.reference),
                Some(_) => missing(channels.target),
            })?;

        match field.correct_point(point) {
            Ok(correction) => {
                let shifted = point
                    .with_channel_shifted(channels.target, &correction)
                    .ok_or_else(|| missing(channels.target))?;
                let corrected = difference - correction;
                outcome.corrected.push(CorrectedPoint {
                    point: shifted,
                    correction,
                    difference: corrected,
                    distance: scale.norm(&corrected),
                });
            }
            Err(CorrectionError::UnableToCorrect { x, y }) => {
                log::debug!("point {} at ({x:.2}, {y:.2}) is outside calibration coverage", point.label());
                outcome.uncorrected.push(UncorrectedPoint {
                    label: point.label(),
                    x,
                    y,
                });
            }
            Err(err) => return Err(err),
        }
    }

    if !outcome.uncorrected.is_empty() {
        log::warn!(
            "{} of {} points could not be corrected",
            outcome.uncorrected.len(),
            points.len()
        );
    }
    Ok(outcome)
}
