use crate::calibration::{Calibrator, CalibratorRegistry};
use crate::config::{DaemonConfig, ManagerConfig};
use crate::device::Device;
use crate::manager::{DeviceEvent, Manager};
use crate::Result;
use std::sync::Arc;

/// Registry of devices and calibrators around one [`Manager`].
///
/// Devices are constructed against [`DeviceManager::manager`] and handed over
/// with [`add_device`](Self::add_device). [`start`](Self::start) freezes the
/// namespace and starts every device thread.
pub struct DeviceManager {
    manager: Arc<Manager>,
    calibrators: CalibratorRegistry,
    devices: Vec<Box<dyn Device>>,
}

impl DeviceManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            manager: Manager::new(config),
            calibrators: CalibratorRegistry::new(),
            devices: Vec::new(),
        }
    }

    /// Create the manager and load every configured calibrator.
    ///
    /// Devices still have to be constructed by the caller, since each needs
    /// its hardware-specific part.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let mut daemon = Self::new(config.manager.clone());
        daemon.calibrators = CalibratorRegistry::from_configs(&config.calibrators)?;
        Ok(daemon)
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn calibrators(&self) -> &CalibratorRegistry {
        &self.calibrators
    }

    pub fn add_calibrator(&mut self, name: impl Into<String>, calibrator: Arc<dyn Calibrator>) {
        self.calibrators.insert(name, calibrator);
    }

    /// Take ownership of a constructed device; returns its registry index.
    ///
    /// # Panics
    /// If the registry was already started, or the device was constructed
    /// against a different [`Manager`].
    pub fn add_device(&mut self, device: Box<dyn Device>) -> usize {
        assert!(
            !self.manager.is_finalized(),
            "cannot add device '{}' after the device manager was started",
            device.name()
        );
        assert!(
            Arc::ptr_eq(device.manager(), &self.manager),
            "device '{}' was constructed against a different device manager",
            device.name()
        );
        log::info!("Registered device '{}'", device.name());
        self.devices.push(device);
        self.devices.len() - 1
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, index: usize) -> &dyn Device {
        self.devices[index].as_ref()
    }

    pub fn device_mut(&mut self, index: usize) -> &mut dyn Device {
        self.devices[index].as_mut()
    }

    pub fn find_device(&self, name: &str) -> Option<&dyn Device> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    /// Freeze the namespace and start every device.
    ///
    /// A device that fails to start is logged and reported as
    /// [`DeviceEvent::Failed`]; the others still start. Returns the number of
    /// devices running.
    pub fn start(&mut self) -> usize {
        self.manager.finalize();

        let mut started = 0;
        for device in &mut self.devices {
            match device.start() {
                Ok(()) => started += 1,
                Err(e) => {
                    log::error!("Failed to start device '{}': {}", device.name(), e);
                    self.manager.report_event(DeviceEvent::Failed {
                        device: device.name().to_owned(),
                        error: e.to_string(),
                    });
                }
            }
        }
        log::info!("Started {} of {} devices", started, self.devices.len());
        started
    }

    /// Stop every device, most recently added first.
    pub fn stop(&mut self) {
        for device in self.devices.iter_mut().rev() {
            device.stop();
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelDevice;
    use crate::types::FeatureLayout;

    #[test]
    fn test_start_and_stop_all_devices() {
        let mut daemon = DeviceManager::new(ManagerConfig::default());
        let (a, _tx_a) = ChannelDevice::new("a", daemon.manager(), &FeatureLayout::new(1, 0, 0));
        let (b, _tx_b) = ChannelDevice::new("b", daemon.manager(), &FeatureLayout::new(1, 0, 0));
        daemon.add_device(Box::new(a));
        daemon.add_device(Box::new(b));

        assert_eq!(daemon.start(), 2);
        assert!(daemon.manager().is_finalized());
        assert!(daemon.device(0).is_running());
        assert_eq!(daemon.find_device("b").map(|d| d.tracker_index_base()), Some(1));

        daemon.stop();
        daemon.stop();
        assert!(!daemon.device(1).is_running());
    }

    #[test]
    #[should_panic(expected = "after the device manager was started")]
    fn test_add_device_after_start_panics() {
        let mut daemon = DeviceManager::new(ManagerConfig::default());
        let (late, _tx) = ChannelDevice::new("late", daemon.manager(), &FeatureLayout::default());
        daemon.start();
        daemon.add_device(Box::new(late));
    }

    #[test]
    #[should_panic(expected = "different device manager")]
    fn test_add_device_from_other_manager_panics() {
        let mut daemon = DeviceManager::new(ManagerConfig::default());
        let other = Manager::new(ManagerConfig::default());
        let (stray, _tx) = ChannelDevice::new("stray", &other, &FeatureLayout::new(1, 0, 0));
        daemon.add_device(Box::new(stray));
    }

    #[test]
    fn test_from_config_builds_calibrators() {
        let config = DaemonConfig::from_toml_str(
            r#"
[[calibrator]]
name = "lift"
type = "transform"
transform = { translation = [0.0, 0.0, 1.0] }
"#,
        )
        .unwrap();
        let daemon = DeviceManager::from_config(&config).unwrap();
        assert_eq!(daemon.calibrators().len(), 1);
        assert!(daemon.calibrators().get("lift").is_some());
    }
}
