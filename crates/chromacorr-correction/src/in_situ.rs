//! In-situ recalibration from a proxy channel pair.
//!
//! When the target pair is poorly sampled by the calibration set, a second
//! pair measured densely in the experiment can stand in for it. Per
//! dimension, the target difference is regressed robustly on the proxy
//! difference and the prediction is subtracted.

use chromacorr_core::{
    bisquare_line_fit, BisquareParams, CalibrationPoint, ChannelIndex, ChannelPair, LineFit,
    RobustFitError,
};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InSituError {
    #[error("{points} points are not enough for an in-situ fit (need {required})")]
    InsufficientData { points: usize, required: usize },
    #[error("in-situ regression for dimension {dimension} is singular")]
    SingularFit { dimension: usize },
    #[error("point {label} has no channel {channel}")]
    MissingChannel { label: u32, channel: ChannelIndex },
}

/// Per-dimension linear map from proxy difference to target difference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InSituModel {
    proxy: ChannelPair,
    target: ChannelPair,
    fits: [LineFit; 3],
    intercept_disabled: bool,
}

fn differences(
    point: &CalibrationPoint,
    pair: ChannelPair,
) -> Result<Vector3<f64>, InSituError> {
    point.difference(pair).ok_or_else(|| {
        let channel = if point.channel(pair.reference).is_none() {
            pair.reference
        } else {
            pair.target
        };
        InSituError::MissingChannel {
            label: point.label(),
            channel,
        }
    })
}

impl InSituModel {
    /// Fit with the default bisquare settings.
    pub fn fit(
        points: &[CalibrationPoint],
        proxy: ChannelPair,
        target: ChannelPair,
        disable_intercept: bool,
    ) -> Result<Self, InSituError> {
        let params = BisquareParams {
            fit_intercept: !disable_intercept,
            ..BisquareParams::default()
        };
        Self::fit_with(points, proxy, target, &params)
    }

    pub fn fit_with(
        points: &[CalibrationPoint],
        proxy: ChannelPair,
        target: ChannelPair,
        params: &BisquareParams,
    ) -> Result<Self, InSituError> {
        let mut proxy_diffs = Vec::with_capacity(points.len());
        let mut target_diffs = Vec::with_capacity(points.len());
        for point in points {
            proxy_diffs.push(differences(point, proxy)?);
            target_diffs.push(differences(point, target)?);
        }

        let mut fits = [LineFit {
            slope: 0.0,
            intercept: 0.0,
        }; 3];
        for (dimension, fit) in fits.iter_mut().enumerate() {
            let x: Vec<f64> = proxy_diffs.iter().map(|d| d[dimension]).collect();
            let y: Vec<f64> = target_diffs.iter().map(|d| d[dimension]).collect();
            *fit = bisquare_line_fit(&x, &y, params).map_err(|err| match err {
                RobustFitError::InsufficientData { got, required } => {
                    InSituError::InsufficientData {
                        points: got,
                        required,
                    }
                }
                _ => InSituError::SingularFit { dimension },
            })?;
        }
        log::debug!(
            "in-situ fit over {} points: slopes ({:.4}, {:.4}, {:.4})",
            points.len(),
            fits[0].slope,
            fits[1].slope,
            fits[2].slope
        );

        Ok(Self {
            proxy,
            target,
            fits,
            intercept_disabled: !params.fit_intercept,
        })
    }

    pub fn proxy(&self) -> ChannelPair {
        self.proxy
    }

    pub fn target(&self) -> ChannelPair {
        self.target
    }

    pub fn fits(&self) -> &[LineFit; 3] {
        &self.fits
    }

    pub fn intercept_disabled(&self) -> bool {
        self.intercept_disabled
    }

    /// `target_diff − (slope · proxy_diff + intercept)` per dimension.
    pub fn correct_difference(
        &self,
        proxy_diff: &Vector3<f64>,
        target_diff: &Vector3<f64>,
    ) -> Vector3<f64> {
        Vector3::from_fn(|d, _| {
            let fit = &self.fits[d];
            let predicted = if self.intercept_disabled {
                fit.slope * proxy_diff[d]
            } else {
                fit.eval(proxy_diff[d])
            };
            target_diff[d] - predicted
        })
    }

    /// Corrected target difference for every point, in input order.
    pub fn apply(&self, points: &[CalibrationPoint]) -> Result<Vec<Vector3<f64>>, InSituError> {
        points
            .iter()
            .map(|point| {
                let proxy_diff = differences(point, self.proxy)?;
                let target_diff = differences(point, self.target)?;
                Ok(self.correct_difference(&proxy_diff, &target_diff))
            })
            .collect()
    }
}

pub fn fit_in_situ(
    points: &[CalibrationPoint],
    proxy: ChannelPair,
    target: ChannelPair,
    disable_intercept: bool,
) -> Result<InSituModel, InSituError> {
    InSituModel::fit(points, proxy, target, disable_intercept)
}

pub fn apply_in_situ(
    model: &InSituModel,
    points: &[CalibrationPoint],
) -> Result<Vec<Vector3<f64>>, InSituError> {
    model.apply(points)
}
