//! Construction of a [`CorrectionField`] from calibration points.

use chromacorr_core::{CalibrationPoint, ChannelIndex, ChannelPair, QuadraticNormalEquations};
use nalgebra::{Point2, Point3, Vector3};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::error::CorrectionError;
use crate::field::{CorrectionField, LocalCorrection, LocalQuadraticFit};
use crate::neighbors::adaptive_neighborhood;

/// Reference-channel position and measured aberration of one point.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Sample {
    pub label: u32,
    pub position: Point3<f64>,
    pub difference: Vector3<f64>,
}

impl Sample {
    pub fn from_point(point: &CalibrationPoint, channels: ChannelPair) -> Result<Self, CorrectionError> {
        let missing = |channel| CorrectionError::MissingChannel {
            label: point.label(),
            channel,
        };
        let position = point
            .position(channels.reference)
            .ok_or_else(|| missing(channels.reference))?;
        let target = point
            .position(channels.target)
            .ok_or_else(|| missing(channels.target))?;
        Ok(Self {
            label: point.label(),
            position,
            difference: target - position,
        })
    }
}

/// Builds correction fields for one channel pair and neighbor count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrectionBuilder {
    channels: ChannelPair,
    neighbors: usize,
}

impl CorrectionBuilder {
    pub fn new(channels: ChannelPair, neighbors: usize) -> Self {
        Self {
            channels,
            neighbors,
        }
    }

    #[inline]
    pub fn channels(&self) -> ChannelPair {
        self.channels
    }

    #[inline]
    pub fn neighbors(&self) -> usize {
        self.neighbors
    }

    /// Fail early on configurations no point set can satisfy.
    pub(crate) fn check_neighbors(&self) -> Result<(), CorrectionError> {
        if self.neighbors == 0 {
            Err(CorrectionError::InvalidNeighborCount)
        } else {
            Ok(())
        }
    }

    /// Fit one local quadratic model per point and assemble the field.
    ///
    /// Any singular neighborhood aborts the whole build.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip_all, fields(points = points.len(), k = self.neighbors))
    )]
    pub fn build(&self, points: &[CalibrationPoint]) -> Result<CorrectionField, CorrectionError> {
        self.check_neighbors()?;
        let samples = points
            .iter()
            .map(|p| Sample::from_point(p, self.channels))
            .collect::<Result<Vec<_>, _>>()?;
        self.build_from_samples(&samples)
    }

    pub(crate) fn build_from_samples(
        &self,
        samples: &[Sample],
    ) -> Result<CorrectionField, CorrectionError> {
        let k = self.neighbors;
        self.check_neighbors()?;
        if samples.len() < k.max(2) {
            return Err(CorrectionError::InsufficientData {
                points: samples.len(),
                k,
            });
        }

        let xy: Vec<Point2<f64>> = samples.iter().map(|s| s.position.xy()).collect();
        let mut extrapolated = 0usize;
        let mut locals = Vec::with_capacity(samples.len());

        for (index, sample) in samples.iter().enumerate() {
            let nb = adaptive_neighborhood(index, &xy, k);
            if !(nb.radius.is_finite() && nb.radius > 0.0) {
                return Err(CorrectionError::DegenerateRadius {
                    index,
                    label: sample.label,
                });
            }
            if nb.extrapolated {
                extrapolated += 1;
            }

            let mut normal = QuadraticNormalEquations::new();
            for &m in &nb.members {
                let offset = xy[m] - xy[index];
                normal.add_row(offset.x, offset.y, &samples[m].difference);
            }
            let coefficients = normal.solve().map_err(|_| CorrectionError::SingularFit {
                index,
                label: sample.label,
            })?;

            let column = |d: usize| {
                LocalQuadraticFit::new(std::array::from_fn(|r| coefficients[(r, d)]))
            };
            locals.push(LocalCorrection {
                label: sample.label,
                position: sample.position,
                radius: nb.radius,
                fits: [column(0), column(1), column(2)],
            });
        }

        if extrapolated > 0 {
            log::warn!(
                "{extrapolated} of {} points have fewer than {} neighbors; their radius was extrapolated",
                samples.len(),
                k + 1
            );
        }
        log::debug!(
            "built correction field for channels {} -> {} from {} points (k = {k})",
            self.channels.reference,
            self.channels.target,
            samples.len()
        );

        CorrectionField::new(self.channels, locals)
    }
}

/// Build a field correcting `correction_channel` against `reference_channel`.
pub fn build(
    points: &[CalibrationPoint],
    reference_channel: ChannelIndex,
    correction_channel: ChannelIndex,
    k: usize,
) -> Result<CorrectionField, CorrectionError> {
    CorrectionBuilder::new(ChannelPair::new(reference_channel, correction_channel), k).build(points)
}
