use chromacorr_core::{ChannelIndex, ChannelPair, PhysicalScale};
use serde::{Deserialize, Serialize};

use crate::builder::CorrectionBuilder;

fn default_max_threads() -> usize {
    1
}

/// Parameters shared by correction building, cross-validation and in-situ recalibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionParams {
    /// Channel whose positions are taken as ground truth.
    pub reference_channel: ChannelIndex,
    /// Channel whose aberration relative to the reference is corrected.
    pub channel_to_correct: ChannelIndex,
    /// Neighbor count `k` driving the adaptive radius.
    pub num_points: usize,
    /// Lateral pixel size (nm).
    pub pixelsize_nm: f64,
    /// Axial section thickness (nm).
    pub z_sectionsize_nm: f64,
    /// Worker count for leave-one-out trials; 1 runs them sequentially.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Second channel of the proxy pair used for in-situ recalibration.
    #[serde(default)]
    pub in_situ_aberr_corr_channel: Option<ChannelIndex>,
    #[serde(default)]
    pub disable_in_situ_intercept: bool,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        Self {
            reference_channel: 0,
            channel_to_correct: 1,
            num_points: 36,
            pixelsize_nm: 80.0,
            z_sectionsize_nm: 100.0,
            max_threads: default_max_threads(),
            in_situ_aberr_corr_channel: None,
            disable_in_situ_intercept: false,
        }
    }
}

impl CorrectionParams {
    /// `(reference_channel, channel_to_correct)`.
    pub fn channels(&self) -> ChannelPair {
        ChannelPair::new(self.reference_channel, self.channel_to_correct)
    }

    pub fn scale(&self) -> PhysicalScale {
        PhysicalScale::new(self.pixelsize_nm, self.z_sectionsize_nm)
    }

    /// Proxy pair `(reference, in-situ channel)`, when in-situ recalibration is configured.
    pub fn in_situ_proxy(&self) -> Option<ChannelPair> {
        self.in_situ_aberr_corr_channel
            .map(|ch| ChannelPair::new(self.reference_channel, ch))
    }

    pub fn builder(&self) -> CorrectionBuilder {
        CorrectionBuilder::new(self.channels(), self.num_points)
    }
}
