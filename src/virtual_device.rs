use crate::types::TrackType;
use nalgebra::{Isometry3, Point3, Vector3};

/// One user-facing controller assembled from logical features.
///
/// Features may come from several physical devices; consumers see only this
/// grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDevice {
    pub name: String,
    pub track_type: TrackType,
    /// Pointing ray in the tracker's local frame.
    pub ray_direction: Vector3<f64>,
    pub ray_start: f64,
    pub tracker_index: Option<usize>,
    pub buttons: Vec<(String, usize)>,
    pub valuators: Vec<(String, usize)>,
}

impl VirtualDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            track_type: TrackType::SIX_DOF,
            ray_direction: Vector3::new(0.0, 1.0, 0.0),
            ray_start: 0.0,
            tracker_index: None,
            buttons: Vec::new(),
            valuators: Vec::new(),
        }
    }

    pub fn with_tracker(mut self, index: usize, track_type: TrackType) -> Self {
        self.tracker_index = Some(index);
        self.track_type = track_type;
        self
    }

    pub fn with_ray(mut self, direction: Vector3<f64>, start: f64) -> Self {
        self.ray_direction = direction;
        self.ray_start = start;
        self
    }

    pub fn with_button(mut self, name: impl Into<String>, index: usize) -> Self {
        self.buttons.push((name.into(), index));
        self
    }

    pub fn with_valuator(mut self, name: impl Into<String>, index: usize) -> Self {
        self.valuators.push((name.into(), index));
        self
    }

    pub fn num_buttons(&self) -> usize {
        self.buttons.len()
    }

    pub fn num_valuators(&self) -> usize {
        self.valuators.len()
    }

    pub fn button_index(&self, i: usize) -> usize {
        self.buttons[i].1
    }

    pub fn valuator_index(&self, i: usize) -> usize {
        self.valuators[i].1
    }

    /// Start point of the pointing ray for a tracker at the given pose.
    pub fn ray_origin(&self, pose: &Isometry3<f64>) -> Point3<f64> {
        pose.transform_point(&Point3::from(self.ray_direction.normalize() * self.ray_start))
    }
}
