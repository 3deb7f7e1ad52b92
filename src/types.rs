use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

/// 6DOF state of one tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerState {
    /// Position in meters.
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    /// Linear velocity in meters per second.
    pub linear_velocity: Vector3<f64>,
    /// Angular velocity as a scaled rotation axis, radians per second.
    pub angular_velocity: Vector3<f64>,
    /// Sample timestamp in microseconds since the manager epoch.
    pub timestamp_us: u64,
}

impl TrackerState {
    /// A motionless sample at the given pose.
    pub fn from_pose(position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> Self {
        Self {
            position,
            orientation,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            timestamp_us: 0,
        }
    }

    pub fn pose(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }

    /// Transform this sample by a rigid transformation applied on the left.
    ///
    /// Velocities are rotated but not translated.
    pub fn transformed(&self, transform: &Isometry3<f64>) -> Self {
        let rotation = transform.rotation;
        Self {
            position: transform.transform_vector(&self.position) + transform.translation.vector,
            orientation: rotation * self.orientation,
            linear_velocity: rotation * self.linear_velocity,
            angular_velocity: rotation * self.angular_velocity,
            timestamp_us: self.timestamp_us,
        }
    }
}

impl Default for TrackerState {
    fn default() -> Self {
        Self::from_pose(Vector3::zeros(), UnitQuaternion::identity())
    }
}

bitflags::bitflags! {
    /// Per-device tracker processing options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrackerFlags: u32 {
        /// Derive linear and angular velocity from consecutive samples.
        const ESTIMATE_VELOCITY = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Which parts of a virtual device's tracker are meaningful.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrackType: u32 {
        const POSITION    = 1 << 0;
        const DIRECTION   = 1 << 1;
        const ORIENTATION = 1 << 2;
        const SIX_DOF     = Self::POSITION.bits() | Self::DIRECTION.bits() | Self::ORIENTATION.bits();
    }
}

/// A contiguous block of logical indices owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureRange {
    pub base: usize,
    pub count: usize,
}

impl FeatureRange {
    /// Translate a device-local index into a logical index.
    ///
    /// Panics if `local` is outside the range; that indicates a driver bug.
    pub fn logical(&self, local: usize) -> usize {
        assert!(
            local < self.count,
            "device-local index {} out of range (device owns {})",
            local,
            self.count
        );
        self.base + local
    }

    pub fn contains(&self, logical: usize) -> bool {
        logical >= self.base && logical < self.base + self.count
    }
}

/// The logical index blocks owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureRanges {
    pub trackers: FeatureRange,
    pub buttons: FeatureRange,
    pub valuators: FeatureRange,
}

/// Features a device asks the manager to allocate at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureLayout {
    pub trackers: usize,
    pub buttons: usize,
    pub valuators: usize,
    pub tracker_names: Vec<String>,
    pub button_names: Vec<String>,
    pub valuator_names: Vec<String>,
}

impl FeatureLayout {
    pub fn new(trackers: usize, buttons: usize, valuators: usize) -> Self {
        Self {
            trackers,
            buttons,
            valuators,
            ..Default::default()
        }
    }

    pub fn with_tracker_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracker_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_button_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.button_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_valuator_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.valuator_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// A decoded measurement in device-local indices, produced by a driver's
/// hardware layer and applied through [`DeviceCore::apply`](crate::device::DeviceCore::apply).
#[derive(Debug, Clone, PartialEq)]
pub enum RawReport {
    Tracker {
        index: usize,
        state: TrackerState,
        timestamp_us: u64,
    },
    Button {
        index: usize,
        pressed: bool,
    },
    Valuator {
        index: usize,
        value: f64,
    },
    /// The device's features are consistent as of this report.
    EndOfCycle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_feature_range_translation() {
        let range = FeatureRange { base: 4, count: 2 };
        assert_eq!(range.logical(0), 4);
        assert_eq!(range.logical(1), 5);
        assert!(range.contains(5));
        assert!(!range.contains(6));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_feature_range_rejects_foreign_index() {
        FeatureRange { base: 0, count: 1 }.logical(1);
    }

    #[test]
    fn test_transformed_rotates_velocity() {
        let mut state = TrackerState::from_pose(Vector3::new(1.0, 0.0, 0.0), UnitQuaternion::identity());
        state.linear_velocity = Vector3::new(1.0, 0.0, 0.0);
        let quarter = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        let transform = Isometry3::from_parts(Translation3::new(0.0, 0.0, 2.0), quarter);

        let out = state.transformed(&transform);
        assert_relative_eq!(out.position, Vector3::new(0.0, 1.0, 2.0), epsilon = 1e-12);
        assert_relative_eq!(out.linear_velocity, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(out.orientation.angle(), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
    }
}
