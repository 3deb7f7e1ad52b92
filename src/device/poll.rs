use super::thread::{DeviceThread, STOP_POLL_INTERVAL_MS, TRANSIENT_WARN_AFTER};
use super::{Device, DeviceCore};
use crate::manager::Manager;
use crate::types::{FeatureLayout, FeatureRanges};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source polled at a fixed interval, such as a tracking daemon publishing
/// samples into shared memory.
pub trait Poller: Send {
    /// Read whatever the source published since the last call and forward
    /// it through `core`.
    ///
    /// Returns `true` if new samples were forwarded; the device then ends the
    /// batch with [`DeviceCore::update_state`].
    fn poll(&mut self, core: &mut DeviceCore) -> Result<bool>;
}

impl<F> Poller for F
where
    F: FnMut(&mut DeviceCore) -> Result<bool> + Send,
{
    fn poll(&mut self, core: &mut DeviceCore) -> Result<bool> {
        self(core)
    }
}

pub struct PollDevice {
    thread: DeviceThread<Box<dyn Poller>>,
    interval: Duration,
}

impl PollDevice {
    pub fn new(
        name: impl Into<String>,
        manager: &Arc<Manager>,
        layout: &FeatureLayout,
        interval: Duration,
        poller: Box<dyn Poller>,
    ) -> Self {
        let core = DeviceCore::new(name, manager, layout);
        Self {
            thread: DeviceThread::new(core, poller),
            interval,
        }
    }

    pub fn core_mut(&mut self) -> Option<&mut DeviceCore> {
        self.thread.core_mut()
    }
}

fn poll_loop(
    core: &mut DeviceCore,
    poller: &mut Box<dyn Poller>,
    stop_flag: &AtomicBool,
    interval: Duration,
) -> Result<()> {
    let mut transient = 0u32;
    while !stop_flag.load(Ordering::Relaxed) {
        match poller.poll(core) {
            Ok(updated) => {
                transient = 0;
                if updated {
                    core.update_state();
                }
            }
            Err(e) if e.is_transient() => {
                transient += 1;
                if transient == TRANSIENT_WARN_AFTER {
                    log::warn!("Device '{}': {} consecutive poll errors, last: {}", core.name(), transient, e);
                } else {
                    log::trace!("Device '{}' transient poll error: {}", core.name(), e);
                }
            }
            Err(e) => return Err(e),
        }
        sleep_unless_stopped(interval, stop_flag);
    }
    Ok(())
}

/// Sleep for `interval` in slices no longer than the stop poll interval.
fn sleep_unless_stopped(interval: Duration, stop_flag: &AtomicBool) {
    let slice = Duration::from_millis(STOP_POLL_INTERVAL_MS);
    let deadline = Instant::now() + interval;
    loop {
        let now = Instant::now();
        if now >= deadline || stop_flag.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep((deadline - now).min(slice));
    }
}

impl Device for PollDevice {
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
        let interval = self.interval;
        self.thread
            .start(move |core, poller, stop| poll_loop(core, poller, stop, interval))
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
    use crate::error::DeviceError;
    use crate::manager::DeviceEvent;
    use crate::types::TrackerState;
    use nalgebra::Vector3;

    #[test]
    fn test_poller_drives_cycles() {
        let manager = Manager::new(ManagerConfig::default());
        let mut frame = 0u64;
        let poller = move |core: &mut DeviceCore| -> Result<bool> {
            frame += 1;
            let mut state = TrackerState::default();
            state.position = Vector3::new(frame as f64, 0.0, 0.0);
            core.set_tracker_state(0, &state, frame * 1000);
            Ok(true)
        };
        let mut device = PollDevice::new(
            "shm",
            &manager,
            &FeatureLayout::new(1, 0, 0),
            Duration::from_millis(1),
            Box::new(poller),
        );
        manager.finalize();
        device.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.cycle() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        device.stop();
        assert!(manager.cycle() >= 3);
    }

    #[test]
    fn test_stop_does_not_wait_for_long_interval() {
        let manager = Manager::new(ManagerConfig::default());
        let mut device = PollDevice::new(
            "slow",
            &manager,
            &FeatureLayout::new(0, 1, 0),
            Duration::from_secs(30),
            Box::new(|_core: &mut DeviceCore| -> Result<bool> { Ok(false) }),
        );
        manager.finalize();
        device.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        device.stop();
        assert!(!device.is_running());
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "stop took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let manager = Manager::new(ManagerConfig::default());
        let events = manager.events();
        let mut calls = 0;
        let poller = move |_core: &mut DeviceCore| -> Result<bool> {
            calls += 1;
            match calls {
                1 | 2 => Err(DeviceError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted))),
                _ => Err(DeviceError::Io(std::io::Error::from(std::io::ErrorKind::NotFound))),
            }
        };
        let mut device = PollDevice::new(
            "flaky",
            &manager,
            &FeatureLayout::new(0, 0, 1),
            Duration::from_millis(1),
            Box::new(poller),
        );
        manager.finalize();
        device.start().unwrap();

        let failed = events
            .iter()
            .find(|e| matches!(e, DeviceEvent::Failed { .. }))
            .unwrap();
        assert!(matches!(failed, DeviceEvent::Failed { error, .. } if error.contains("not found")));
        device.stop();
    }
}
