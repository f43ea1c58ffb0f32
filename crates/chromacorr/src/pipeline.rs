//! Calibrate-and-apply orchestration.
//!
//! `run` mirrors a full session: filter calibration points, build or load a
//! correction, optionally cross-validate it, apply it, and summarise the
//! residual distances with a P3D fit. An optional in-situ stage refines the
//! result from a proxy channel pair.

use std::fs;

use chromacorr_core::{fit_p3d, CalibrationPoint, P3dFit, P3dFitError, PhysicalScale};
use chromacorr_correction::{
    apply_correction, load_points_json, read_correction_file, write_correction_file,
    write_distances, write_points_json, CorrectionError, CorrectionField, CorrectionIoError,
    InSituError, InSituModel, TreError, TreEstimator, TreReport,
};
use serde::Serialize;

use crate::config::{ConfigIoError, RunConfig};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigIoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Files(#[from] CorrectionIoError),
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error(transparent)]
    Tre(#[from] TreError),
    #[error(transparent)]
    InSitu(#[from] InSituError),
    #[error(transparent)]
    P3d(#[from] P3dFitError),
    #[error("no calibration points left after quality filtering ({rejected} rejected)")]
    NoPoints { rejected: usize },
    #[error("in-situ data was given but no in-situ channel is configured")]
    MissingInSituChannel,
}

/// Outcome of the localization quality filter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    pub kept: usize,
    pub distance_failures: usize,
    pub fit_error_failures: usize,
}

/// Drop points whose channels are implausibly far apart or poorly localized.
///
/// The separation check runs first; a point failing it is not counted again
/// by the fit-error check. A NaN fit error always fails.
pub fn filter_points(
    points: Vec<CalibrationPoint>,
    scale: &PhysicalScale,
    distance_cutoff: Option<f64>,
    fit_error_cutoff: Option<f64>,
) -> (Vec<CalibrationPoint>, QualityReport) {
    let mut report = QualityReport::default();
    let kept: Vec<CalibrationPoint> = points
        .into_iter()
        .filter(|p| {
            if let Some(cutoff) = distance_cutoff {
                if !(p.max_channel_separation(scale) <= cutoff) {
                    report.distance_failures += 1;
                    return false;
                }
            }
            if let Some(cutoff) = fit_error_cutoff {
                if !(p.total_fit_error() <= cutoff) {
                    report.fit_error_failures += 1;
                    return false;
                }
            }
            true
        })
        .collect();
    report.kept = kept.len();

    if distance_cutoff.is_some() {
        log::info!("{} points failed the channel separation check", report.distance_failures);
    }
    if fit_error_cutoff.is_some() {
        log::info!("{} points failed the fit error check", report.fit_error_failures);
    }
    (kept, report)
}

/// Scalar results of one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub quality: QualityReport,
    pub field_points: usize,
    pub tre_3d: Option<f64>,
    pub tre_2d: Option<f64>,
    pub tre_failed: Option<usize>,
    pub corrected: usize,
    pub uncorrected: usize,
    pub p3d: Option<P3dFit>,
    pub in_situ_corrected: Option<usize>,
    pub in_situ_p3d: Option<P3dFit>,
}

fn load_filtered(
    config: &RunConfig,
    path: &str,
) -> Result<(Vec<CalibrationPoint>, QualityReport), PipelineError> {
    let points = load_points_json(path)?;
    let loaded = points.len();
    let (kept, quality) = filter_points(
        points,
        &config.correction.scale(),
        config.distance_cutoff,
        config.fit_error_cutoff,
    );
    log::info!("loaded {loaded} points from {path}, kept {}", kept.len());
    if kept.is_empty() {
        return Err(PipelineError::NoPoints { rejected: loaded });
    }
    Ok((kept, quality))
}

fn estimate_tre(config: &RunConfig, points: &[CalibrationPoint]) -> Result<TreReport, TreError> {
    TreEstimator::new(config.correction.builder(), config.correction.scale())
        .with_max_threads(config.correction.max_threads)
        .estimate(points)
}

fn fit_distances(config: &RunConfig, distances: &[f64], what: &str) -> Option<P3dFit> {
    match fit_p3d(distances, &config.p3d_options()) {
        Ok(fit) => {
            log::info!("P3D fit to {what} distances: m = {:.3} nm, s = {:.3} nm", fit.m, fit.s);
            Some(fit)
        }
        Err(err) => {
            log::warn!("P3D fit to {what} distances failed: {err}");
            None
        }
    }
}

fn obtain_field(
    config: &RunConfig,
    points: &[CalibrationPoint],
) -> Result<CorrectionField, PipelineError> {
    let path = config.correction_path();
    if config.determine_correction {
        let field = config.correction.builder().build(points)?;
        write_correction_file(&field, &path)?;
        Ok(field)
    } else {
        Ok(read_correction_file(&path)?)
    }
}

/// Run the whole pipeline described by `config`.
pub fn run(config: &RunConfig) -> Result<RunSummary, PipelineError> {
    let scale = config.correction.scale();
    let (points, quality) = load_filtered(config, &config.position_data)?;
    let field = obtain_field(config, &points)?;

    let mut summary = RunSummary {
        quality,
        field_points: field.len(),
        ..RunSummary::default()
    };

    if config.determine_tre && config.determine_correction {
        match estimate_tre(config, &points) {
            Ok(report) => {
                summary.tre_3d = Some(report.tre_3d);
                summary.tre_2d = Some(report.tre_2d);
                summary.tre_failed = Some(report.failed);
            }
            Err(TreError::NoSuccessfulTrials { failed }) => {
                log::warn!("no leave-one-out trial succeeded ({failed} failed); TRE unavailable");
                summary.tre_failed = Some(failed);
            }
            Err(err) => return Err(err.into()),
        }
    }

    let outcome = apply_correction(&field, &points, &scale)?;
    summary.corrected = outcome.corrected.len();
    summary.uncorrected = outcome.uncorrected.len();

    fs::create_dir_all(&config.output_positions_to_directory)?;
    let corrected_points = outcome.points();
    let distances = outcome.distances();
    write_points_json(&corrected_points, config.positions_output_path())?;
    write_distances(&distances, config.distances_output_path())?;
    summary.p3d = fit_distances(config, &distances, "corrected");

    if let Some(path) = &config.in_situ_position_data {
        let proxy = config
            .correction
            .in_situ_proxy()
            .ok_or(PipelineError::MissingInSituChannel)?;
        let (in_situ_points, _) = load_filtered(config, path)?;
        let in_situ_corrected = apply_correction(&field, &in_situ_points, &scale)?.points();

        let model = InSituModel::fit(
            &in_situ_corrected,
            proxy,
            config.correction.channels(),
            config.correction.disable_in_situ_intercept,
        )?;
        let differences = model.apply(&corrected_points)?;
        let in_situ_distances: Vec<f64> = differences.iter().map(|d| scale.norm(d)).collect();
        write_distances(&in_situ_distances, config.in_situ_distances_output_path())?;

        summary.in_situ_corrected = Some(differences.len());
        summary.in_situ_p3d = fit_distances(config, &in_situ_distances, "in-situ corrected");
    }

    Ok(summary)
}

/// Leave-one-out TRE on the filtered calibration points only.
pub fn run_tre(config: &RunConfig) -> Result<TreReport, PipelineError> {
    let (points, _) = load_filtered(config, &config.position_data)?;
    Ok(estimate_tre(config, &points)?)
}
