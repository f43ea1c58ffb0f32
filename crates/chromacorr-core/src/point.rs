use nalgebra::{Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Index of an imaging channel (wavelength) in a multi-channel stack.
pub type ChannelIndex = usize;

/// Localized position of one object in one channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelPosition {
    /// Sub-pixel position in pixel / section units `(x, y, z)`.
    pub position: Point3<f64>,
    /// Per-dimension localization error reported by the upstream fitter.
    #[serde(default = "Vector3::zeros")]
    pub fit_error: Vector3<f64>,
}

impl ChannelPosition {
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            fit_error: Vector3::zeros(),
        }
    }

    pub fn with_fit_error(mut self, fit_error: Vector3<f64>) -> Self {
        self.fit_error = fit_error;
        self
    }
}

/// The pair of channels a correction maps between.
///
/// Differences are always taken as `target - reference`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPair {
    pub reference: ChannelIndex,
    pub target: ChannelIndex,
}

impl ChannelPair {
    pub const fn new(reference: ChannelIndex, target: ChannelIndex) -> Self {
        Self { reference, target }
    }
}

/// Per-axis conversion from pixel / section units to physical distance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicalScale {
    /// Lateral pixel size (nm).
    pub xy_nm: f64,
    /// Axial section thickness (nm).
    pub z_nm: f64,
}

impl PhysicalScale {
    pub const fn new(xy_nm: f64, z_nm: f64) -> Self {
        Self { xy_nm, z_nm }
    }

    /// Identity scale, leaves vectors in pixel units.
    pub const fn pixels() -> Self {
        Self::new(1.0, 1.0)
    }

    #[inline]
    pub fn to_physical(&self, v: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(v.x * self.xy_nm, v.y * self.xy_nm, v.z * self.z_nm)
    }

    /// 3D norm of `v` in physical units.
    #[inline]
    pub fn norm(&self, v: &Vector3<f64>) -> f64 {
        self.to_physical(v).norm()
    }

    /// Lateral (xy-only) norm of `v` in physical units.
    #[inline]
    pub fn norm_xy(&self, v: &Vector3<f64>) -> f64 {
        self.xy_nm * v.x.hypot(v.y)
    }
}

/// One localized calibration object imaged in several channels.
///
/// Points are immutable once created. Operations that move a channel return a
/// new point instead of editing this one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    label: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_id: Option<String>,
    channels: Vec<ChannelPosition>,
}

impl CalibrationPoint {
    /// Create a point from its per-channel positions, indexed by channel.
    pub fn new(label: u32, channels: Vec<ChannelPosition>) -> Self {
        Self {
            label,
            image_id: None,
            channels,
        }
    }

    /// Convenience constructor from bare positions (zero fit error).
    pub fn from_positions(label: u32, positions: &[Point3<f64>]) -> Self {
        Self::new(
            label,
            positions.iter().copied().map(ChannelPosition::new).collect(),
        )
    }

    /// Attach the identifier of the image the object was localized in.
    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    #[inline]
    pub fn label(&self) -> u32 {
        self.label
    }

    pub fn image_id(&self) -> Option<&str> {
        self.image_id.as_deref()
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[ChannelPosition] {
        &self.channels
    }

    #[inline]
    pub fn channel(&self, channel: ChannelIndex) -> Option<&ChannelPosition> {
        self.channels.get(channel)
    }

    #[inline]
    pub fn position(&self, channel: ChannelIndex) -> Option<Point3<f64>> {
        self.channel(channel).map(|c| c.position)
    }

    /// Lateral position in `channel`.
    #[inline]
    pub fn xy(&self, channel: ChannelIndex) -> Option<Point2<f64>> {
        self.position(channel).map(|p| p.xy())
    }

    /// Vector from the reference channel position to the target channel position.
    pub fn difference(&self, channels: ChannelPair) -> Option<Vector3<f64>> {
        let reference = self.position(channels.reference)?;
        let target = self.position(channels.target)?;
        Some(target - reference)
    }

    /// Return a copy with `channel` moved by `-correction`.
    ///
    /// This is how a measured aberration is removed from a channel: the
    /// difference to any other channel shrinks by `correction`.
    pub fn with_channel_shifted(
        &self,
        channel: ChannelIndex,
        correction: &Vector3<f64>,
    ) -> Option<Self> {
        let mut out = self.clone();
        let entry = out.channels.get_mut(channel)?;
        entry.position -= *correction;
        Some(out)
    }

    /// Localization error summed in quadrature over channels and dimensions.
    pub fn total_fit_error(&self) -> f64 {
        self.channels
            .iter()
            .map(|c| c.fit_error.norm_squared())
            .sum::<f64>()
            .sqrt()
    }

    /// Largest physical distance between any two channels of this object.
    pub fn max_channel_separation(&self, scale: &PhysicalScale) -> f64 {
        let mut max_dist = 0.0f64;
        for (i, a) in self.channels.iter().enumerate() {
            for b in &self.channels[i + 1..] {
                max_dist = max_dist.max(scale.norm(&(b.position - a.position)));
            }
        }
        max_dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_channel_point() -> CalibrationPoint {
        CalibrationPoint::from_positions(
            7,
            &[Point3::new(10.0, 20.0, 5.0), Point3::new(10.5, 19.0, 5.25)],
        )
    }

    #[test]
    fn difference_is_target_minus_reference() {
        let p = two_channel_point();
        let d = p.difference(ChannelPair::new(0, 1)).expect("both channels");
        assert_relative_eq!(d, Vector3::new(0.5, -1.0, 0.25));
        assert!(p.difference(ChannelPair::new(0, 2)).is_none());
    }

    #[test]
    fn shifting_a_channel_removes_the_correction_from_the_difference() {
        let p = two_channel_point();
        let pair = ChannelPair::new(0, 1);
        let shifted = p
            .with_channel_shifted(1, &Vector3::new(0.5, -1.0, 0.25))
            .expect("channel exists");
        assert_relative_eq!(shifted.difference(pair).unwrap(), Vector3::zeros());
        // original untouched
        assert_relative_eq!(p.difference(pair).unwrap(), Vector3::new(0.5, -1.0, 0.25));
    }

    #[test]
    fn separation_uses_physical_units() {
        let p = two_channel_point();
        let scale = PhysicalScale::new(80.0, 100.0);
        let expected = (40.0f64.powi(2) + 80.0f64.powi(2) + 25.0f64.powi(2)).sqrt();
        assert_relative_eq!(p.max_channel_separation(&scale), expected, epsilon = 1e-12);
    }

    #[test]
    fn fit_error_adds_in_quadrature() {
        let p = CalibrationPoint::new(
            1,
            vec![
                ChannelPosition::new(Point3::origin()).with_fit_error(Vector3::new(3.0, 0.0, 0.0)),
                ChannelPosition::new(Point3::origin()).with_fit_error(Vector3::new(0.0, 4.0, 0.0)),
            ],
        );
        assert_relative_eq!(p.total_fit_error(), 5.0);
    }

    #[test]
    fn json_round_trip_keeps_optional_image_id_off_the_wire() {
        let p = two_channel_point();
        let json = serde_json::to_string(&p).expect("serialize");
        assert!(!json.contains("image_id"));
        let back: CalibrationPoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, p);

        let tagged = p.with_image_id("stack_03.ome.tif");
        let json = serde_json::to_string(&tagged).expect("serialize");
        let back: CalibrationPoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.image_id(), Some("stack_03.ome.tif"));
    }
}
