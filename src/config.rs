use crate::error::DeviceError;
use crate::types::{FeatureLayout, TrackType, TrackerFlags};
use crate::Result;
use nalgebra::{Isometry3, Translation3, Unit, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level daemon configuration, read once before any device is built.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DaemonConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
    #[serde(default, rename = "calibrator")]
    pub calibrators: Vec<CalibratorConfig>,
}

impl DaemonConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::info!("Loading device configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut calibrators = HashSet::new();
        for calibrator in &self.calibrators {
            if !calibrators.insert(calibrator.name.as_str()) {
                return Err(DeviceError::Config(format!(
                    "duplicate calibrator name '{}'",
                    calibrator.name
                )));
            }
        }

        let mut devices = HashSet::new();
        for device in &self.devices {
            if !devices.insert(device.name.as_str()) {
                return Err(DeviceError::Config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            if let Some(name) = &device.calibrator {
                if !calibrators.contains(name.as_str()) {
                    return Err(DeviceError::UnknownCalibrator(name.clone()));
                }
            }
            device.validate()?;
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long without a completed update cycle before the manager reports
    /// itself stalled.
    pub stall_timeout_ms: u64,
    /// Capacity of the device event channel; events beyond it are dropped.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 1000,
            event_capacity: 64,
        }
    }
}

impl ManagerConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub trackers: usize,
    #[serde(default)]
    pub buttons: usize,
    #[serde(default)]
    pub valuators: usize,
    #[serde(default)]
    pub tracker_names: Vec<String>,
    #[serde(default)]
    pub button_names: Vec<String>,
    #[serde(default)]
    pub valuator_names: Vec<String>,
    #[serde(default)]
    pub estimate_velocity: bool,
    /// Name of a calibrator attached to every tracker of this device.
    #[serde(default)]
    pub calibrator: Option<String>,
    /// Fixed transformation applied to every tracker after calibration.
    #[serde(default)]
    pub post_transform: Option<TransformConfig>,
    #[serde(default, rename = "virtual_device")]
    pub virtual_devices: Vec<VirtualDeviceConfig>,
    #[serde(default)]
    pub hid: Option<HidConfig>,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, trackers: usize, buttons: usize, valuators: usize) -> Self {
        Self {
            name: name.into(),
            trackers,
            buttons,
            valuators,
            tracker_names: Vec::new(),
            button_names: Vec::new(),
            valuator_names: Vec::new(),
            estimate_velocity: false,
            calibrator: None,
            post_transform: None,
            virtual_devices: Vec::new(),
            hid: None,
        }
    }

    fn validate(&self) -> Result<()> {
        let too_many = |what: &str, names: usize, count: usize| {
            DeviceError::Config(format!(
                "device '{}' names {} {}s but has only {}",
                self.name, names, what, count
            ))
        };
        if self.tracker_names.len() > self.trackers {
            return Err(too_many("tracker", self.tracker_names.len(), self.trackers));
        }
        if self.button_names.len() > self.buttons {
            return Err(too_many("button", self.button_names.len(), self.buttons));
        }
        if self.valuator_names.len() > self.valuators {
            return Err(too_many("valuator", self.valuator_names.len(), self.valuators));
        }

        for vd in &self.virtual_devices {
            let out_of_range = |what: &str, index: usize| {
                DeviceError::Config(format!(
                    "virtual device '{}' on '{}' references {} {} which does not exist",
                    vd.name, self.name, what, index
                ))
            };
            if let Some(t) = vd.tracker {
                if t >= self.trackers {
                    return Err(out_of_range("tracker", t));
                }
            }
            if let Some(&b) = vd.buttons.iter().find(|&&b| b >= self.buttons) {
                return Err(out_of_range("button", b));
            }
            if let Some(&v) = vd.valuators.iter().find(|&&v| v >= self.valuators) {
                return Err(out_of_range("valuator", v));
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> FeatureLayout {
        FeatureLayout::new(self.trackers, self.buttons, self.valuators)
            .with_tracker_names(self.tracker_names.iter().cloned())
            .with_button_names(self.button_names.iter().cloned())
            .with_valuator_names(self.valuator_names.iter().cloned())
    }

    pub fn tracker_flags(&self) -> TrackerFlags {
        if self.estimate_velocity {
            TrackerFlags::ESTIMATE_VELOCITY
        } else {
            TrackerFlags::empty()
        }
    }
}

/// Rigid transformation given as translation plus axis/angle rotation.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TransformConfig {
    #[serde(default)]
    pub translation: [f64; 3],
    #[serde(default = "default_axis")]
    pub axis: [f64; 3],
    #[serde(default)]
    pub angle_deg: f64,
}

fn default_axis() -> [f64; 3] {
    [0.0, 0.0, 1.0]
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            axis: default_axis(),
            angle_deg: 0.0,
        }
    }
}

impl TransformConfig {
    pub fn to_isometry(&self) -> Isometry3<f64> {
        let axis = Vector3::from(self.axis);
        let rotation = match Unit::try_new(axis, 1e-12) {
            Some(axis) => UnitQuaternion::from_axis_angle(&axis, self.angle_deg.to_radians()),
            None => UnitQuaternion::identity(),
        };
        Isometry3::from_parts(Translation3::from(Vector3::from(self.translation)), rotation)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackTypeConfig {
    Position,
    Ray,
    #[default]
    SixDof,
}

impl From<TrackTypeConfig> for TrackType {
    fn from(value: TrackTypeConfig) -> Self {
        match value {
            TrackTypeConfig::Position => TrackType::POSITION,
            TrackTypeConfig::Ray => TrackType::POSITION | TrackType::DIRECTION,
            TrackTypeConfig::SixDof => TrackType::SIX_DOF,
        }
    }
}

/// A virtual device expressed in the owning device's local indices.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct VirtualDeviceConfig {
    pub name: String,
    #[serde(default)]
    pub tracker: Option<usize>,
    #[serde(default)]
    pub track_type: TrackTypeConfig,
    #[serde(default = "default_ray_direction")]
    pub ray_direction: [f64; 3],
    #[serde(default)]
    pub ray_start: f64,
    #[serde(default)]
    pub buttons: Vec<usize>,
    #[serde(default)]
    pub valuators: Vec<usize>,
}

fn default_ray_direction() -> [f64; 3] {
    [0.0, 1.0, 0.0]
}

/// USB HID device selection.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct HidConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default = "default_report_size")]
    pub report_size: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: i32,
}

fn default_report_size() -> usize {
    64
}

fn default_read_timeout_ms() -> i32 {
    100
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CalibratorConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: CalibratorKind,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibratorKind {
    Grid {
        file: PathBuf,
        #[serde(default)]
        calibrate_velocity: bool,
    },
    Transform {
        #[serde(default)]
        transform: TransformConfig,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[manager]
stall_timeout_ms = 250

[[calibrator]]
name = "room"
type = "grid"
file = "room.grid"
calibrate_velocity = true

[[calibrator]]
name = "offset"
type = "transform"
transform = { translation = [0.0, 0.0, 1.5] }

[[device]]
name = "tracker"
trackers = 2
buttons = 2
tracker_names = ["head", "wand"]
estimate_velocity = true
calibrator = "room"

[[device.virtual_device]]
name = "Wand"
tracker = 1
track_type = "ray"
buttons = [0, 1]

[device.hid]
vendor_id = 0x040E
product_id = 0xF408

[[device]]
name = "joystick"
valuators = 3
"#;

    #[test]
    fn test_parse_sample() {
        let config = DaemonConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.manager.stall_timeout(), Duration::from_millis(250));
        assert_eq!(config.manager.event_capacity, 64);
        assert_eq!(config.calibrators.len(), 2);
        assert!(matches!(
            config.calibrators[0].kind,
            CalibratorKind::Grid { calibrate_velocity: true, .. }
        ));

        let tracker = config.device("tracker").unwrap();
        assert_eq!(tracker.tracker_flags(), TrackerFlags::ESTIMATE_VELOCITY);
        assert_eq!(tracker.layout().tracker_names, vec!["head", "wand"]);
        assert_eq!(tracker.virtual_devices[0].track_type, TrackTypeConfig::Ray);
        let hid = tracker.hid.as_ref().unwrap();
        assert_eq!(hid.vendor_id, 0x040E);
        assert_eq!(hid.report_size, 64);

        let joystick = config.device("joystick").unwrap();
        assert_eq!(joystick.layout(), FeatureLayout::new(0, 0, 3));
    }

    #[test]
    fn test_unknown_calibrator_rejected() {
        let text = r#"
[[device]]
name = "a"
trackers = 1
calibrator = "missing"
"#;
        assert!(matches!(
            DaemonConfig::from_toml_str(text),
            Err(DeviceError::UnknownCalibrator(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_virtual_device_index_checked() {
        let text = r#"
[[device]]
name = "a"
buttons = 1

[[device.virtual_device]]
name = "Pad"
buttons = [0, 1]
"#;
        assert!(matches!(
            DaemonConfig::from_toml_str(text),
            Err(DeviceError::Config(_))
        ));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        assert!(matches!(
            DaemonConfig::from_toml_str("[[device]\nname ="),
            Err(DeviceError::ConfigSyntax(_))
        ));
    }

    #[test]
    fn test_transform_config_to_isometry() {
        let transform = TransformConfig {
            translation: [1.0, 2.0, 3.0],
            axis: [0.0, 0.0, 1.0],
            angle_deg: 90.0,
        };
        let iso = transform.to_isometry();
        let p = iso.transform_point(&nalgebra::Point3::new(1.0, 0.0, 0.0));
        assert!((p - nalgebra::Point3::new(1.0, 3.0, 3.0)).norm() < 1e-12);

        let degenerate = TransformConfig {
            axis: [0.0; 3],
            angle_deg: 45.0,
            ..Default::default()
        };
        assert_eq!(degenerate.to_isometry().rotation, UnitQuaternion::identity());
    }
}
