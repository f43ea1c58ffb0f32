use chromacorr_core::ChannelIndex;

/// Errors returned while building or querying a correction field.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CorrectionError {
    /// No calibration point covers the query location.
    #[error("unable to correct position ({x}, {y}): no calibration point covers it")]
    UnableToCorrect { x: f64, y: f64 },
    #[error("local quadratic fit around point {index} (label {label}) is singular")]
    SingularFit { index: usize, label: u32 },
    #[error("{points} calibration points are not enough for {k} neighbors")]
    InsufficientData { points: usize, k: usize },
    #[error("neighbor count must be positive")]
    InvalidNeighborCount,
    #[error("adaptive radius of point {index} (label {label}) is not positive")]
    DegenerateRadius { index: usize, label: u32 },
    #[error("point {label} has no channel {channel}")]
    MissingChannel { label: u32, channel: ChannelIndex },
    #[error("invalid correction field: {0}")]
    InvalidField(String),
}
