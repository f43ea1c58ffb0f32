//! JSON run configuration for the calibrate-and-apply pipeline.

use std::fs;
use std::path::{Path, PathBuf};

use chromacorr_core::P3dFitOptions;
use chromacorr_correction::CorrectionParams;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn default_true() -> bool {
    true
}

/// Everything one pipeline run needs, read from a single flat JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub correction: CorrectionParams,
    /// Calibration / experimental points (JSON array of points).
    pub position_data: String,
    /// Densely sampled points used to fit the in-situ model.
    #[serde(default)]
    pub in_situ_position_data: Option<String>,
    /// Directory holding correction files.
    pub data_directory: String,
    /// Prefix of the correction file name.
    pub correction_date: String,
    pub output_positions_to_directory: String,
    pub basename: String,
    /// Build a new correction; otherwise load the stored one.
    #[serde(default = "default_true")]
    pub determine_correction: bool,
    #[serde(default)]
    pub determine_tre: bool,
    #[serde(default)]
    pub log_detailed_messages: bool,
    /// Largest allowed inter-channel separation of a calibration point (nm).
    #[serde(default)]
    pub distance_cutoff: Option<f64>,
    /// Largest allowed total localization error of a calibration point.
    #[serde(default)]
    pub fit_error_cutoff: Option<f64>,
    /// Cap on per-distance negative log-probability in the P3D fit.
    #[serde(default)]
    pub robust_p3d_fit_cutoff: Option<f64>,
}

impl RunConfig {
    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigIoError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigIoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// `<data_directory>/<correction_date>_correction.xml`
    pub fn correction_path(&self) -> PathBuf {
        Path::new(&self.data_directory).join(format!("{}_correction.xml", self.correction_date))
    }

    fn output_path(&self, suffix: &str) -> PathBuf {
        Path::new(&self.output_positions_to_directory).join(format!("{}{suffix}", self.basename))
    }

    pub fn positions_output_path(&self) -> PathBuf {
        self.output_path("_position_data.json")
    }

    pub fn distances_output_path(&self) -> PathBuf {
        self.output_path("_diffs.txt")
    }

    pub fn in_situ_distances_output_path(&self) -> PathBuf {
        self.output_path("_in_situ_diffs.txt")
    }

    pub fn p3d_options(&self) -> P3dFitOptions {
        P3dFitOptions {
            robust_cutoff: self.robust_p3d_fit_cutoff,
            ..P3dFitOptions::default()
        }
    }
}
