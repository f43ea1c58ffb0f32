//! Chromatic aberration correction for multi-channel 3D localization data.
//!
//! This facade re-exports the numerical core and the correction engine and
//! adds the JSON-configured pipeline used by the `chromacorr` binary.
//!
//! ```no_run
//! use chromacorr::{pipeline, RunConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::load_json("run.json")?;
//! let summary = pipeline::run(&config)?;
//! println!("corrected {} points", summary.corrected);
//! # Ok(())
//! # }
//! ```

pub use chromacorr_core as core;
pub use chromacorr_correction as correction;

pub mod config;
pub mod pipeline;

pub use chromacorr_correction::{
    aberration_map, apply_correction, build, leave_one_out_tre, read_correction_file,
    write_correction_file, AberrationMap, CalibrationPoint, ChannelPair, CorrectionBuilder,
    CorrectionError, CorrectionField, CorrectionParams, InSituModel, PhysicalScale, TreEstimator,
    TreReport,
};
pub use config::{ConfigIoError, RunConfig};
pub use pipeline::{run, run_tre, PipelineError, RunSummary};
