//! Chromatic aberration correction fields.
//!
//! A [`CorrectionField`] is built from calibration points imaged in two
//! channels. Around every point a quadratic model of the channel difference
//! is fitted over an adaptive neighborhood, and queries blend the models of
//! all points whose radius covers the query location.
//!
//! ```no_run
//! use chromacorr_correction::{build, read_correction_file};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let points = Vec::new();
//! let field = build(&points, 0, 1, 36)?;
//! let correction = field.correct(512.0, 480.0)?;
//! # let _ = (correction, read_correction_file("c.xml")?);
//! # Ok(())
//! # }
//! ```

mod apply;
mod builder;
mod error;
mod field;
mod in_situ;
mod io;
mod map;
mod neighbors;
mod params;
mod tre;

pub use apply::{apply_correction, CorrectedPoint, CorrectionOutcome, UncorrectedPoint};
pub use builder::{build, CorrectionBuilder};
pub use error::CorrectionError;
pub use field::{blending_weight, CorrectionField, LocalCorrection, LocalQuadraticFit};
pub use in_situ::{apply_in_situ, fit_in_situ, InSituError, InSituModel};
pub use io::{
    correction_from_xml, correction_to_xml, load_points_json, read_correction_file,
    write_correction_file, write_distances, write_points_json, CorrectionIoError,
};
pub use map::{aberration_map, AberrationMap};
pub use params::CorrectionParams;
pub use tre::{leave_one_out_tre, TreError, TreEstimator, TreReport, TreTrial, TrialOutcome};

pub use chromacorr_core::{CalibrationPoint, ChannelIndex, ChannelPair, ChannelPosition, PhysicalScale};
