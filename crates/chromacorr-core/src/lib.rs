//! Core types and numerics for multi-channel aberration correction.
//!
//! This crate is intentionally small. It knows about calibration points and
//! the handful of dense solves the correction engine needs, but nothing about
//! correction fields, files or images.

mod linalg;
mod logger;
mod p3d;
mod point;
mod robust;

pub use linalg::{
    leverages, quadratic_basis, weighted_least_squares, LinalgError, QuadraticNormalEquations,
    QUADRATIC_TERMS,
};
pub use p3d::{fit_p3d, p3d_density, P3dFit, P3dFitError, P3dFitOptions};
pub use point::{CalibrationPoint, ChannelIndex, ChannelPair, ChannelPosition, PhysicalScale};
pub use robust::{bisquare_line_fit, median, BisquareParams, LineFit, RobustFitError};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, level_for_verbosity};
