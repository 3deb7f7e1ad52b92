//! Device drivers.
//!
//! A driver owns one background thread that blocks on its hardware and
//! reports measurements through a [`DeviceCore`]. The core translates
//! device-local indices into logical ones, runs calibration, applies the
//! post-transform, estimates velocity and writes into the [`Manager`].

pub mod channel;
pub mod hid;
pub mod poll;
pub mod thread;

use crate::calibration::{Calibrator, CalibratorRegistry};
use crate::config::DeviceConfig;
use crate::manager::Manager;
use crate::namespace::FeatureKind;
use crate::types::{FeatureLayout, FeatureRanges, RawReport, TrackerFlags, TrackerState};
use crate::virtual_device::VirtualDevice;
use crate::Result;
use nalgebra::{Isometry3, Vector3};
use std::sync::Arc;

pub use channel::ChannelDevice;
pub use hid::{HidDevice, HidReportDecoder};
pub use poll::{PollDevice, Poller};
pub use thread::DeviceThread;

/// A physical device driver.
///
/// `start` and `stop` are idempotent. `stop` on a device that never started
/// returns immediately.
pub trait Device: Send {
    fn name(&self) -> &str;

    fn ranges(&self) -> FeatureRanges;

    /// The manager this device registered its features with.
    fn manager(&self) -> &Arc<Manager>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn tracker_index_base(&self) -> usize {
        self.ranges().trackers.base
    }

    fn button_index_base(&self) -> usize {
        self.ranges().buttons.base
    }

    fn valuator_index_base(&self) -> usize {
        self.ranges().valuators.base
    }
}

/// Per-device processing shared by every driver.
pub struct DeviceCore {
    name: String,
    manager: Arc<Manager>,
    ranges: FeatureRanges,
    flags: TrackerFlags,
    calibrators: Vec<Option<Arc<dyn Calibrator>>>,
    post_transforms: Vec<Option<Isometry3<f64>>>,
    previous: Vec<Option<TrackerState>>,
}

impl DeviceCore {
    /// Register the layout's features with the manager.
    ///
    /// Call this only after the hardware was opened successfully so a failed
    /// device never occupies logical indices.
    pub fn new(name: impl Into<String>, manager: &Arc<Manager>, layout: &FeatureLayout) -> Self {
        let name = name.into();
        let ranges = FeatureRanges {
            trackers: manager.add_features(FeatureKind::Tracker, layout.trackers, &layout.tracker_names),
            buttons: manager.add_features(FeatureKind::Button, layout.buttons, &layout.button_names),
            valuators: manager.add_features(FeatureKind::Valuator, layout.valuators, &layout.valuator_names),
        };
        log::debug!(
            "Device '{}': trackers {:?}, buttons {:?}, valuators {:?}",
            name,
            ranges.trackers,
            ranges.buttons,
            ranges.valuators
        );

        Self {
            name,
            manager: Arc::clone(manager),
            ranges,
            flags: TrackerFlags::empty(),
            calibrators: vec![None; layout.trackers],
            post_transforms: vec![None; layout.trackers],
            previous: vec![None; layout.trackers],
        }
    }

    /// Apply a device section: velocity flag, calibrator, post-transform and
    /// virtual devices.
    pub fn configure(&mut self, config: &DeviceConfig, calibrators: &CalibratorRegistry) -> Result<()> {
        self.flags = config.tracker_flags();
        if let Some(name) = &config.calibrator {
            let calibrator = calibrators.require(name)?;
            for local in 0..self.ranges.trackers.count {
                self.set_calibrator(local, Arc::clone(&calibrator));
            }
        }
        if let Some(transform) = &config.post_transform {
            let transform = transform.to_isometry();
            for local in 0..self.ranges.trackers.count {
                self.set_post_transform(local, transform);
            }
        }

        for vd in &config.virtual_devices {
            let mut device = VirtualDevice::new(&vd.name)
                .with_ray(Vector3::from(vd.ray_direction), vd.ray_start);
            if let Some(tracker) = vd.tracker {
                device = device.with_tracker(self.ranges.trackers.logical(tracker), vd.track_type.into());
            }
            for &button in &vd.buttons {
                let name = config
                    .button_names
                    .get(button)
                    .cloned()
                    .unwrap_or_else(|| format!("Button{}", button));
                device = device.with_button(name, self.ranges.buttons.logical(button));
            }
            for &valuator in &vd.valuators {
                let name = config
                    .valuator_names
                    .get(valuator)
                    .cloned()
                    .unwrap_or_else(|| format!("Valuator{}", valuator));
                device = device.with_valuator(name, self.ranges.valuators.logical(valuator));
            }
            self.manager.add_virtual_device(device);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn ranges(&self) -> FeatureRanges {
        self.ranges
    }

    pub fn tracker_index_base(&self) -> usize {
        self.ranges.trackers.base
    }

    pub fn button_index_base(&self) -> usize {
        self.ranges.buttons.base
    }

    pub fn valuator_index_base(&self) -> usize {
        self.ranges.valuators.base
    }

    pub fn flags(&self) -> TrackerFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: TrackerFlags) {
        self.flags = flags;
    }

    pub fn set_calibrator(&mut self, local: usize, calibrator: Arc<dyn Calibrator>) {
        self.ranges.trackers.logical(local);
        self.calibrators[local] = Some(calibrator);
    }

    pub fn set_post_transform(&mut self, local: usize, transform: Isometry3<f64>) {
        self.ranges.trackers.logical(local);
        self.post_transforms[local] = Some(transform);
    }

    /// Register a virtual device built from this device's logical indices.
    pub fn add_virtual_device(&self, device: VirtualDevice) -> usize {
        self.manager.add_virtual_device(device)
    }

    /// Microseconds on the manager's clock.
    pub fn timestamp_us(&self) -> u64 {
        self.manager.timestamp_us()
    }

    /// Run calibration, post-transform and velocity estimation on one raw
    /// sample without publishing it.
    pub fn process_tracker(&mut self, local: usize, raw: &TrackerState, timestamp_us: u64) -> TrackerState {
        self.ranges.trackers.logical(local);

        let mut state = match &self.calibrators[local] {
            Some(calibrator) => calibrator.calibrate(raw),
            None => *raw,
        };
        if let Some(transform) = &self.post_transforms[local] {
            state = state.transformed(transform);
        }
        state.timestamp_us = timestamp_us;

        if self.flags.contains(TrackerFlags::ESTIMATE_VELOCITY) {
            if let Some(prev) = &self.previous[local] {
                if timestamp_us > prev.timestamp_us {
                    let dt = (timestamp_us - prev.timestamp_us) as f64 * 1e-6;
                    state.linear_velocity = (state.position - prev.position) / dt;
                    let delta = state.orientation * prev.orientation.inverse();
                    state.angular_velocity = delta.scaled_axis() / dt;
                }
            }
        }

        self.previous[local] = Some(state);
        state
    }

    pub fn set_tracker_state(&mut self, local: usize, raw: &TrackerState, timestamp_us: u64) {
        let state = self.process_tracker(local, raw, timestamp_us);
        self.manager
            .set_tracker_state(self.ranges.trackers.logical(local), state);
    }

    pub fn set_button_state(&self, local: usize, pressed: bool) {
        self.manager
            .set_button_state(self.ranges.buttons.logical(local), pressed);
    }

    pub fn set_valuator_state(&self, local: usize, value: f64) {
        self.manager
            .set_valuator_state(self.ranges.valuators.logical(local), value);
    }

    /// This device's features are consistent as of now.
    pub fn update_state(&self) {
        self.manager.update_state();
    }

    pub fn apply(&mut self, report: &RawReport) {
        match report {
            RawReport::Tracker {
                index,
                state,
                timestamp_us,
            } => self.set_tracker_state(*index, state, *timestamp_us),
            RawReport::Button { index, pressed } => self.set_button_state(*index, *pressed),
            RawReport::Valuator { index, value } => self.set_valuator_state(*index, *value),
            RawReport::EndOfCycle => self.update_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::TransformCalibrator;
    use crate::config::{ManagerConfig, TransformConfig, VirtualDeviceConfig};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn sample(x: f64, angle: f64) -> TrackerState {
        TrackerState::from_pose(
            Vector3::new(x, 0.0, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angle),
        )
    }

    #[test]
    fn test_index_bases_follow_registration_order() {
        let manager = Manager::new(ManagerConfig::default());
        let a = DeviceCore::new("a", &manager, &FeatureLayout::new(1, 2, 0));
        let b = DeviceCore::new("b", &manager, &FeatureLayout::new(2, 0, 1));
        assert_eq!(a.tracker_index_base(), 0);
        assert_eq!(a.button_index_base(), 0);
        assert_eq!(b.tracker_index_base(), 1);
        assert_eq!(b.button_index_base(), 2);
        assert_eq!(b.valuator_index_base(), 0);
    }

    #[test]
    fn test_velocity_from_consecutive_samples() {
        let manager = Manager::new(ManagerConfig::default());
        let mut core = DeviceCore::new("a", &manager, &FeatureLayout::new(1, 0, 0));
        core.set_flags(TrackerFlags::ESTIMATE_VELOCITY);

        let first = core.process_tracker(0, &sample(1.0, 0.2), 1_000_000);
        assert_eq!(first.linear_velocity, Vector3::zeros());

        let second = core.process_tracker(0, &sample(1.5, 0.2), 1_250_000);
        assert_relative_eq!(second.linear_velocity, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(second.angular_velocity, Vector3::zeros(), epsilon = 1e-12);

        let third = core.process_tracker(0, &sample(1.5, 0.3), 1_750_000);
        assert_relative_eq!(third.linear_velocity, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(third.angular_velocity, Vector3::new(0.0, 0.2, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_velocity_kept_when_time_does_not_advance() {
        let manager = Manager::new(ManagerConfig::default());
        let mut core = DeviceCore::new("a", &manager, &FeatureLayout::new(1, 0, 0));
        core.set_flags(TrackerFlags::ESTIMATE_VELOCITY);

        core.process_tracker(0, &sample(0.0, 0.0), 500);
        let mut raw = sample(1.0, 0.0);
        raw.linear_velocity = Vector3::new(0.0, 0.0, 3.0);
        let out = core.process_tracker(0, &raw, 500);
        assert_eq!(out.linear_velocity, Vector3::new(0.0, 0.0, 3.0));
    }

    #[test]
    fn test_calibration_then_post_transform() {
        let manager = Manager::new(ManagerConfig::default());
        let mut core = DeviceCore::new("a", &manager, &FeatureLayout::new(1, 0, 0));
        core.set_calibrator(0, Arc::new(TransformCalibrator::new(Isometry3::translation(1.0, 0.0, 0.0))));
        core.set_post_transform(
            0,
            Isometry3::from_parts(
                nalgebra::Translation3::new(0.0, 0.0, 0.0),
                UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            ),
        );

        let out = core.process_tracker(0, &sample(1.0, 0.0), 10);
        // (1 + 1, 0, 0) rotated a quarter turn about z.
        assert_relative_eq!(out.position, Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-12);
        assert_eq!(out.timestamp_us, 10);
    }

    #[test]
    fn test_apply_forwards_to_logical_indices() {
        let manager = Manager::new(ManagerConfig::default());
        let _first = DeviceCore::new("first", &manager, &FeatureLayout::new(1, 1, 1));
        let mut core = DeviceCore::new("second", &manager, &FeatureLayout::new(1, 2, 1));
        manager.finalize();

        core.apply(&RawReport::Button { index: 1, pressed: true });
        core.apply(&RawReport::Valuator { index: 0, value: 0.75 });
        core.apply(&RawReport::Tracker {
            index: 0,
            state: sample(2.0, 0.0),
            timestamp_us: 99,
        });

        let guard = manager.lock_state();
        assert!(guard.state().button(2));
        assert!(!guard.state().button(1));
        assert_eq!(guard.state().valuator(1), 0.75);
        assert_eq!(guard.state().tracker(1).position.x, 2.0);
        assert_eq!(guard.state().tracker(1).timestamp_us, 99);
    }

    #[test]
    fn test_configure_registers_virtual_devices() {
        let manager = Manager::new(ManagerConfig::default());
        let mut registry = CalibratorRegistry::new();
        registry.insert("shift", Arc::new(TransformCalibrator::new(Isometry3::translation(0.0, 1.0, 0.0))));

        let _other = DeviceCore::new("other", &manager, &FeatureLayout::new(1, 1, 0));
        let mut config = DeviceConfig::new("wand", 1, 2, 0);
        config.button_names = vec!["Trigger".into()];
        config.calibrator = Some("shift".into());
        config.estimate_velocity = true;
        config.post_transform = Some(TransformConfig {
            translation: [0.0, 0.0, 1.0],
            ..Default::default()
        });
        config.virtual_devices.push(VirtualDeviceConfig {
            name: "Wand".into(),
            tracker: Some(0),
            track_type: Default::default(),
            ray_direction: [0.0, 1.0, 0.0],
            ray_start: 0.0,
            buttons: vec![0, 1],
            valuators: vec![],
        });

        let mut core = DeviceCore::new("wand", &manager, &config.layout());
        core.configure(&config, &registry).unwrap();
        manager.finalize();

        assert_eq!(core.flags(), TrackerFlags::ESTIMATE_VELOCITY);
        let wand = manager.virtual_device(0);
        assert_eq!(wand.tracker_index, Some(1));
        assert_eq!(wand.buttons, vec![("Trigger".to_string(), 1), ("Button1".to_string(), 2)]);

        let out = core.process_tracker(0, &sample(0.0, 0.0), 0);
        assert_relative_eq!(out.position, Vector3::new(0.0, 1.0, 1.0), epsilon = 1e-12);
    }
}
