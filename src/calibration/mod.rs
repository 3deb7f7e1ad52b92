//! Tracker calibration.
//!
//! A [`Calibrator`] corrects one raw tracker sample using previously measured
//! ground truth. Devices attach at most one calibrator per tracker; the same
//! instance may be shared between trackers.

pub mod grid;

use crate::config::{CalibratorConfig, CalibratorKind, TransformConfig};
use crate::error::DeviceError;
use crate::types::TrackerState;
use crate::Result;
use nalgebra::Isometry3;
use std::collections::HashMap;
use std::sync::Arc;

pub use grid::{CalibrationGrid, CorrectionRecord, GridCalibrator};

/// Maps a raw tracker sample to a corrected one.
///
/// Implementations are called from device threads and must not block.
pub trait Calibrator: Send + Sync {
    fn calibrate(&self, raw: &TrackerState) -> TrackerState;

    /// Whether `calibrate` also rotates the sample's velocities.
    fn calibrates_velocity(&self) -> bool {
        false
    }
}

/// Applies one fixed rigid transformation to every sample.
#[derive(Debug, Clone)]
pub struct TransformCalibrator {
    transform: Isometry3<f64>,
}

impl TransformCalibrator {
    pub fn new(transform: Isometry3<f64>) -> Self {
        Self { transform }
    }

    pub fn from_config(config: &TransformConfig) -> Self {
        Self::new(config.to_isometry())
    }
}

impl Calibrator for TransformCalibrator {
    fn calibrate(&self, raw: &TrackerState) -> TrackerState {
        raw.transformed(&self.transform)
    }

    fn calibrates_velocity(&self) -> bool {
        true
    }
}

/// Named calibrators available to devices during setup.
#[derive(Default, Clone)]
pub struct CalibratorRegistry {
    by_name: HashMap<String, Arc<dyn Calibrator>>,
}

impl CalibratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured calibrator, loading grid files from disk.
    pub fn from_configs(configs: &[CalibratorConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let calibrator: Arc<dyn Calibrator> = match &config.kind {
                CalibratorKind::Grid {
                    file,
                    calibrate_velocity,
                } => {
                    let grid = CalibrationGrid::load(file)?;
                    Arc::new(GridCalibrator::new(grid).with_velocity_calibration(*calibrate_velocity))
                }
                CalibratorKind::Transform { transform } => {
                    Arc::new(TransformCalibrator::from_config(transform))
                }
            };
            log::info!("Loaded calibrator '{}'", config.name);
            registry.insert(config.name.clone(), calibrator);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, calibrator: Arc<dyn Calibrator>) {
        self.by_name.insert(name.into(), calibrator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Calibrator>> {
        self.by_name.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn Calibrator>> {
        self.get(name)
            .ok_or_else(|| DeviceError::UnknownCalibrator(name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_transform_calibrator_offsets_position() {
        let calibrator = TransformCalibrator::new(Isometry3::translation(0.0, 0.0, 1.5));
        let raw = TrackerState::from_pose(Vector3::new(1.0, 2.0, 0.0), UnitQuaternion::identity());
        let out = calibrator.calibrate(&raw);
        assert_eq!(out.position, Vector3::new(1.0, 2.0, 1.5));
        assert!(calibrator.calibrates_velocity());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = CalibratorRegistry::new();
        registry.insert("floor", Arc::new(TransformCalibrator::new(Isometry3::identity())));
        assert!(registry.get("floor").is_some());
        assert!(matches!(
            registry.require("ceiling"),
            Err(DeviceError::UnknownCalibrator(name)) if name == "ceiling"
        ));
    }

    #[test]
    fn test_registry_from_configs_reports_missing_grid_file() {
        let configs = vec![CalibratorConfig {
            name: "room".into(),
            kind: CalibratorKind::Grid {
                file: "/nonexistent/room.grid".into(),
                calibrate_velocity: false,
            },
        }];
        assert!(matches!(
            CalibratorRegistry::from_configs(&configs),
            Err(DeviceError::Io(_))
        ));
    }
}
