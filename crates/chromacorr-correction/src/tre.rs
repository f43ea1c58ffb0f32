//! Leave-one-out target registration error.
//!
//! Each trial rebuilds the field without one calibration point and compares
//! the field's prediction at that point with the aberration actually measured
//! there. Trials are independent and run on a rayon pool.

use chromacorr_core::{CalibrationPoint, ChannelIndex, ChannelPair, PhysicalScale};
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::Serialize;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::builder::{CorrectionBuilder, Sample};
use crate::error::CorrectionError;

#[derive(thiserror::Error, Debug)]
pub enum TreError {
    /// The run itself is misconfigured, so no trial can succeed.
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("all {failed} leave-one-out trials failed")]
    NoSuccessfulTrials { failed: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TrialOutcome {
    Succeeded {
        /// `predicted − measured`, in physical units.
        residual: Vector3<f64>,
        error_3d: f64,
        error_2d: f64,
    },
    #[serde(serialize_with = "serialize_error")]
    Failed(CorrectionError),
}

fn serialize_error<S: serde::Serializer>(err: &CorrectionError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(err)
}

/// One held-out point.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TreTrial {
    pub index: usize,
    pub label: u32,
    pub outcome: TrialOutcome,
}

impl TreTrial {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Succeeded { .. })
    }
}

/// Aggregate over the successful trials.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TreReport {
    /// Mean 3D residual norm (physical units).
    pub tre_3d: f64,
    /// Mean lateral residual norm (physical units).
    pub tre_2d: f64,
    pub succeeded: usize,
    pub failed: usize,
    pub trials: Vec<TreTrial>,
}

/// Leave-one-out estimator for one builder configuration.
#[derive(Clone, Debug)]
pub struct TreEstimator {
    builder: CorrectionBuilder,
    scale: PhysicalScale,
    max_threads: usize,
}

impl TreEstimator {
    pub fn new(builder: CorrectionBuilder, scale: PhysicalScale) -> Self {
        Self {
            builder,
            scale,
            max_threads: 1,
        }
    }

    /// Run trials on up to `max_threads` workers (0 and 1 both mean sequential).
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip_all, fields(points = points.len(), threads = self.max_threads))
    )]
    pub fn estimate(&self, points: &[CalibrationPoint]) -> Result<TreReport, TreError> {
        self.builder.check_neighbors()?;
        let channels = self.builder.channels();
        let samples = points
            .iter()
            .map(|p| Sample::from_point(p, channels))
            .collect::<Result<Vec<_>, _>>()?;

        let trials: Vec<TreTrial> = if self.max_threads <= 1 {
            (0..samples.len()).map(|i| self.trial(&samples, i)).collect()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.max_threads)
                .build()?;
            pool.install(|| {
                (0..samples.len())
                    .into_par_iter()
                    .map(|i| self.trial(&samples, i))
                    .collect()
            })
        };

        summarize(trials)
    }

    fn trial(&self, samples: &[Sample], held_out: usize) -> TreTrial {
        let sample = &samples[held_out];
        let rest: Vec<Sample> = samples
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != held_out)
            .map(|(_, s)| *s)
            .collect();

        let outcome = match self
            .builder
            .build_from_samples(&rest)
            .and_then(|field| field.correct(sample.position.x, sample.position.y))
        {
            Ok(predicted) => {
                let residual = self.scale.to_physical(&(predicted - sample.difference));
                TrialOutcome::Succeeded {
                    residual,
                    error_3d: residual.norm(),
                    error_2d: residual.x.hypot(residual.y),
                }
            }
            Err(err) => {
                log::debug!("leave-one-out trial for point {} failed: {err}", sample.label);
                TrialOutcome::Failed(err)
            }
        };

        TreTrial {
            index: held_out,
            label: sample.label,
            outcome,
        }
    }
}

fn summarize(trials: Vec<TreTrial>) -> Result<TreReport, TreError> {
    let mut sum_3d = 0.0;
    let mut sum_2d = 0.0;
    let mut succeeded = 0usize;
    for trial in &trials {
        if let TrialOutcome::Succeeded {
            error_3d, error_2d, ..
        } = trial.outcome
        {
            sum_3d += error_3d;
            sum_2d += error_2d;
            succeeded += 1;
        }
    }
    let failed = trials.len() - succeeded;
    if succeeded == 0 {
        return Err(TreError::NoSuccessfulTrials { failed });
    }

    let report = TreReport {
        tre_3d: sum_3d / succeeded as f64,
        tre_2d: sum_2d / succeeded as f64,
        succeeded,
        failed,
        trials,
    };
    log::info!(
        "leave-one-out TRE: 3D {:.3}, 2D {:.3} over {} trials ({} failed)",
        report.tre_3d,
        report.tre_2d,
        report.succeeded,
        report.failed
    );
    Ok(report)
}

/// Sequential leave-one-out TRE for `correction_channel` against `reference_channel`.
pub fn leave_one_out_tre(
    points: &[CalibrationPoint],
    reference_channel: ChannelIndex,
    correction_channel: ChannelIndex,
    k: usize,
    scale: PhysicalScale,
) -> Result<TreReport, TreError> {
    let builder = CorrectionBuilder::new(ChannelPair::new(reference_channel, correction_channel), k);
    TreEstimator::new(builder, scale).estimate(points)
}
