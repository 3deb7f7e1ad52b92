use super::thread::{DeviceThread, STOP_POLL_INTERVAL_MS};
use super::{Device, DeviceCore};
use crate::calibration::CalibratorRegistry;
use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::manager::Manager;
use crate::types::{FeatureLayout, FeatureRanges, RawReport};
use crate::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Device fed with decoded reports over a channel.
///
/// Bridges producers that already run their own session, such as a network
/// tracking protocol client or a recorded-session replay, into the device
/// model. The producer keeps the [`Sender`]; dropping every sender ends the
/// device like a lost hardware connection.
pub struct ChannelDevice {
    thread: DeviceThread<Receiver<RawReport>>,
}

impl ChannelDevice {
    pub fn new(
        name: impl Into<String>,
        manager: &Arc<Manager>,
        layout: &FeatureLayout,
    ) -> (Self, Sender<RawReport>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let core = DeviceCore::new(name, manager, layout);
        (
            Self {
                thread: DeviceThread::new(core, receiver),
            },
            sender,
        )
    }

    pub fn from_config(
        manager: &Arc<Manager>,
        config: &DeviceConfig,
        calibrators: &CalibratorRegistry,
    ) -> Result<(Self, Sender<RawReport>)> {
        let (mut device, sender) = Self::new(&config.name, manager, &config.layout());
        if let Some(core) = device.core_mut() {
            core.configure(config, calibrators)?;
        }
        Ok((device, sender))
    }

    /// The device core, while the device is stopped.
    pub fn core_mut(&mut self) -> Option<&mut DeviceCore> {
        self.thread.core_mut()
    }
}

fn channel_reader_loop(
    core: &mut DeviceCore,
    receiver: &mut Receiver<RawReport>,
    stop_flag: &std::sync::atomic::AtomicBool,
) -> Result<()> {
    let timeout = Duration::from_millis(STOP_POLL_INTERVAL_MS);
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return Ok(());
        }

        match receiver.recv_timeout(timeout) {
            Ok(report) => core.apply(&report),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DeviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "report source disconnected",
                )));
            }
        }
    }
}

impl Device for ChannelDevice {
    fn name(&self) -> &str {
        self.thread.name()
    }

    fn ranges(&self) -> FeatureRanges {
        self.thread.ranges()
    }

    fn manager(&self) -> &Arc<Manager> {
        self.thread.manager()
    }

    fn start(&mut self) -> Result<()> {
        self.thread.start(channel_reader_loop)
    }

    fn stop(&mut self) {
        self.thread.stop();
    }

    fn is_running(&self) -> bool {
        self.thread.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::manager::DeviceEvent;
    use crate::types::TrackerState;

    #[test]
    fn test_reports_reach_manager() {
        let manager = Manager::new(ManagerConfig::default());
        let (mut device, sender) = ChannelDevice::new("replay", &manager, &FeatureLayout::new(1, 1, 0));
        manager.finalize();
        device.start().unwrap();

        sender.send(RawReport::Button { index: 0, pressed: true }).unwrap();
        sender
            .send(RawReport::Tracker {
                index: 0,
                state: TrackerState::default(),
                timestamp_us: 5,
            })
            .unwrap();
        sender.send(RawReport::EndOfCycle).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.cycle() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        device.stop();

        assert_eq!(manager.cycle(), 1);
        assert!(manager.lock_state().state().button(0));
    }

    #[test]
    fn test_disconnect_fails_only_this_device() {
        let manager = Manager::new(ManagerConfig::default());
        let events = manager.events();
        let (mut device, sender) = ChannelDevice::new("net", &manager, &FeatureLayout::new(0, 1, 0));
        manager.finalize();
        device.start().unwrap();
        drop(sender);

        let failed = events
            .iter()
            .find(|e| matches!(e, DeviceEvent::Failed { .. }))
            .unwrap();
        assert!(matches!(failed, DeviceEvent::Failed { device, .. } if device == "net"));
        device.stop();
        assert!(!device.is_running());
    }
}
