//! The correction field: blended local quadratic models over the image plane.

use std::fmt;

use chromacorr_core::{
    quadratic_basis, CalibrationPoint, ChannelIndex, ChannelPair, QUADRATIC_TERMS,
};
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point2, Point3, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::error::CorrectionError;

/// Slack on the kd-tree search radius so points sitting exactly on a
/// boundary are still visited; the exact weight decides membership.
const SEARCH_SLACK: f64 = 1e-9;

/// Coefficients of `c0 + c1·dx + c2·dy + c3·dx² + c4·dy² + c5·dx·dy`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalQuadraticFit {
    pub coefficients: [f64; QUADRATIC_TERMS],
}

impl LocalQuadraticFit {
    pub fn new(coefficients: [f64; QUADRATIC_TERMS]) -> Self {
        Self { coefficients }
    }

    #[inline]
    pub fn eval(&self, dx: f64, dy: f64) -> f64 {
        self.eval_basis(&quadratic_basis(dx, dy))
    }

    #[inline]
    fn eval_basis(&self, basis: &Vector6<f64>) -> f64 {
        Vector6::from(self.coefficients).dot(basis)
    }
}

/// One calibration point with its adaptive radius and per-dimension fits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalCorrection {
    pub label: u32,
    /// Reference-channel position of the calibration point.
    pub position: Point3<f64>,
    pub radius: f64,
    /// Fits for the x, y and z components of the correction.
    pub fits: [LocalQuadraticFit; 3],
}

impl LocalCorrection {
    #[inline]
    pub fn xy(&self) -> Point2<f64> {
        self.position.xy()
    }

    /// Local model evaluated at offset `(dx, dy)` from this point.
    pub fn evaluate(&self, dx: f64, dy: f64) -> Vector3<f64> {
        let basis = quadratic_basis(dx, dy);
        Vector3::new(
            self.fits[0].eval_basis(&basis),
            self.fits[1].eval_basis(&basis),
            self.fits[2].eval_basis(&basis),
        )
    }

    fn validate(&self, index: usize) -> Result<(), CorrectionError> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(CorrectionError::InvalidField(format!(
                "point {index} has non-positive radius {}",
                self.radius
            )));
        }
        let finite = self.position.iter().all(|v| v.is_finite())
            && self
                .fits
                .iter()
                .all(|f| f.coefficients.iter().all(|c| c.is_finite()));
        if !finite {
            return Err(CorrectionError::InvalidField(format!(
                "point {index} has non-finite position or coefficients"
            )));
        }
        Ok(())
    }
}

/// Blending kernel `2e³ − 3e² + 1` on `[0, 1]`, zero beyond.
///
/// Equals 1 at the point, 0 at its radius, with zero slope at both ends.
#[inline]
pub fn blending_weight(e: f64) -> f64 {
    if (0.0..=1.0).contains(&e) {
        (2.0 * e - 3.0) * e * e + 1.0
    } else {
        0.0
    }
}

/// Serialized form of a [`CorrectionField`]; the spatial index is rebuilt on load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct FieldSnapshot {
    reference_channel: ChannelIndex,
    correction_channel: ChannelIndex,
    points: Vec<LocalCorrection>,
}

/// Immutable correction field mapping reference-channel `(x, y)` to a 3D correction.
///
/// Queries never mutate the field, so one field can be shared across threads.
#[derive(Serialize, Deserialize)]
#[serde(try_from = "FieldSnapshot", into = "FieldSnapshot")]
pub struct CorrectionField {
    channels: ChannelPair,
    locals: Vec<LocalCorrection>,
    tree: KdTree<f64, 2>,
    max_radius: f64,
}

impl CorrectionField {
    /// Assemble a field from its per-point local corrections.
    pub fn new(channels: ChannelPair, locals: Vec<LocalCorrection>) -> Result<Self, CorrectionError> {
        if locals.is_empty() {
            return Err(CorrectionError::InvalidField(
                "a correction field needs at least one point".to_string(),
            ));
        }
        for (index, local) in locals.iter().enumerate() {
            local.validate(index)?;
        }
        Ok(Self::assemble(channels, locals))
    }

    fn assemble(channels: ChannelPair, locals: Vec<LocalCorrection>) -> Self {
        let coords: Vec<[f64; 2]> = locals
            .iter()
            .map(|l| [l.position.x, l.position.y])
            .collect();
        let tree: KdTree<f64, 2> = (&coords).into();
        let max_radius = locals.iter().map(|l| l.radius).fold(0.0, f64::max);
        Self {
            channels,
            locals,
            tree,
            max_radius,
        }
    }

    #[inline]
    pub fn channels(&self) -> ChannelPair {
        self.channels
    }

    #[inline]
    pub fn reference_channel(&self) -> ChannelIndex {
        self.channels.reference
    }

    #[inline]
    pub fn correction_channel(&self) -> ChannelIndex {
        self.channels.target
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.locals.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    pub fn locals(&self) -> &[LocalCorrection] {
        &self.locals
    }

    /// Correction at reference-channel position `(x, y)`.
    ///
    /// Every point whose radius contains the query contributes its local model,
    /// weighted by [`blending_weight`]. Contributions are summed in point order.
    pub fn correct(&self, x: f64, y: f64) -> Result<Vector3<f64>, CorrectionError> {
        if !(x.is_finite() && y.is_finite()) {
            return Err(CorrectionError::UnableToCorrect { x, y });
        }

        let reach = self.max_radius * (1.0 + SEARCH_SLACK);
        let mut candidates: Vec<usize> = self
            .tree
            .within_unsorted::<SquaredEuclidean>(&[x, y], reach * reach)
            .iter()
            .map(|nn| nn.item as usize)
            .collect();
        candidates.sort_unstable();

        let mut sum = Vector3::zeros();
        let mut total_weight = 0.0;
        for index in candidates {
            let local = &self.locals[index];
            let dx = x - local.position.x;
            let dy = y - local.position.y;
            let w = blending_weight(dx.hypot(dy) / local.radius);
            if w > 0.0 {
                sum += local.evaluate(dx, dy) * w;
                total_weight += w;
            }
        }

        if total_weight > 0.0 {
            Ok(sum / total_weight)
        } else {
            Err(CorrectionError::UnableToCorrect { x, y })
        }
    }

    /// Correction at the reference-channel position of `point`.
    pub fn correct_point(&self, point: &CalibrationPoint) -> Result<Vector3<f64>, CorrectionError> {
        let xy = point
            .xy(self.channels.reference)
            .ok_or(CorrectionError::MissingChannel {
                label: point.label(),
                channel: self.channels.reference,
            })?;
        self.correct(xy.x, xy.y)
    }
}

impl Clone for CorrectionField {
    fn clone(&self) -> Self {
        Self::assemble(self.channels, self.locals.clone())
    }
}

impl PartialEq for CorrectionField {
    fn eq(&self, other: &Self) -> bool {
        self.channels == other.channels && self.locals == other.locals
    }
}

impl fmt::Debug for CorrectionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrectionField")
            .field("channels", &self.channels)
            .field("points", &self.locals.len())
            .field("max_radius", &self.max_radius)
            .finish()
    }
}

/// Parse a JSON snapshot, keeping syntax errors apart from invalid field contents.
pub(crate) fn decode_snapshot(
    bytes: &[u8],
) -> Result<Result<CorrectionField, CorrectionError>, serde_json::Error> {
    let snapshot: FieldSnapshot = serde_json::from_slice(bytes)?;
    Ok(CorrectionField::try_from(snapshot))
}

impl TryFrom<FieldSnapshot> for CorrectionField {
    type Error = CorrectionError;

    fn try_from(snapshot: FieldSnapshot) -> Result<Self, Self::Error> {
        Self::new(
            ChannelPair::new(snapshot.reference_channel, snapshot.correction_channel),
            snapshot.points,
        )
    }
}

impl From<CorrectionField> for FieldSnapshot {
    fn from(field: CorrectionField) -> Self {
        Self {
            reference_channel: field.channels.reference,
            correction_channel: field.channels.target,
            points: field.locals,
        }
    }
}
