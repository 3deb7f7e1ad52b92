use super::DeviceCore;
use crate::error::DeviceError;
use crate::manager::{DeviceEvent, Manager};
use crate::types::FeatureRanges;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// How long a blocking hardware read may wait before re-checking the stop flag.
pub const STOP_POLL_INTERVAL_MS: u64 = 100;

/// Consecutive transient read errors after which a driver logs a warning.
pub const TRANSIENT_WARN_AFTER: u32 = 20;

enum Slot<Io> {
    Idle(DeviceCore, Io),
    Running {
        stop_flag: Arc<AtomicBool>,
        thread: JoinHandle<(DeviceCore, Io)>,
    },
    /// The core and hardware handle are gone; the device cannot run again.
    Lost(LostReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LostReason {
    /// Placeholder while the slot is being swapped.
    Taken,
    Panicked,
    /// `spawn` failed after the core had been moved into the closure.
    SpawnFailed,
}

impl std::fmt::Display for LostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LostReason::Taken => "device state is in use",
            LostReason::Panicked => "communication thread panicked",
            LostReason::SpawnFailed => "communication thread could not be spawned",
        })
    }
}

/// Communication thread of one device.
///
/// Owns the [`DeviceCore`] and the driver's hardware handle `Io`. While the
/// thread runs both are moved into it; joining hands them back so the device
/// can be started again.
pub struct DeviceThread<Io> {
    name: String,
    manager: Arc<Manager>,
    ranges: FeatureRanges,
    slot: Slot<Io>,
}

impl<Io: Send + 'static> DeviceThread<Io> {
    pub fn new(core: DeviceCore, io: Io) -> Self {
        Self {
            name: core.name().to_owned(),
            manager: Arc::clone(core.manager()),
            ranges: core.ranges(),
            slot: Slot::Idle(core, io),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ranges(&self) -> FeatureRanges {
        self.ranges
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// The core, while the thread is not running.
    pub fn core_mut(&mut self) -> Option<&mut DeviceCore> {
        match &mut self.slot {
            Slot::Idle(core, _) => Some(core),
            _ => None,
        }
    }

    /// The hardware handle, while the thread is not running.
    pub fn io_mut(&mut self) -> Option<&mut Io> {
        match &mut self.slot {
            Slot::Idle(_, io) => Some(io),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        match &self.slot {
            Slot::Running { thread, .. } => !thread.is_finished(),
            _ => false,
        }
    }

    /// Spawn the communication thread running `body`.
    ///
    /// `body` loops until the stop flag is set or the hardware fails; it must
    /// not block for longer than [`STOP_POLL_INTERVAL_MS`] at a time. Calling
    /// `start` on a running thread does nothing. A thread that already ended
    /// on its own is joined and restarted.
    ///
    /// If the OS refuses to spawn the thread, `start` returns
    /// [`DeviceError::ThreadSpawn`] and the core and hardware handle are
    /// dropped with `body`; later calls return [`DeviceError::ThreadLost`].
    pub fn start<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut DeviceCore, &mut Io, &AtomicBool) -> Result<()> + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        self.stop();

        let (mut core, mut io) = match std::mem::replace(&mut self.slot, Slot::Lost(LostReason::Taken)) {
            Slot::Idle(core, io) => (core, io),
            Slot::Lost(reason) => {
                self.slot = Slot::Lost(reason);
                return Err(DeviceError::ThreadLost {
                    device: self.name.clone(),
                    reason: reason.to_string(),
                });
            }
            running @ Slot::Running { .. } => {
                self.slot = running;
                return Ok(());
            }
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let name = self.name.clone();

        let thread = std::thread::Builder::new()
            .name(format!("vrdevice-{}", name))
            .spawn(move || {
                let manager = core.manager().clone();
                log::info!("Device '{}' communication thread started", name);
                manager.report_event(DeviceEvent::Started {
                    device: name.clone(),
                });

                match body(&mut core, &mut io, &stop_clone) {
                    Ok(()) => {
                        log::info!("Device '{}' communication thread stopped", name);
                        manager.report_event(DeviceEvent::Stopped { device: name });
                    }
                    Err(e) => {
                        log::error!("Device '{}' failed, no longer reporting: {}", name, e);
                        manager.report_event(DeviceEvent::Failed {
                            device: name,
                            error: e.to_string(),
                        });
                    }
                }
                (core, io)
            })
            .map_err(|e| {
                self.slot = Slot::Lost(LostReason::SpawnFailed);
                DeviceError::ThreadSpawn(e.to_string())
            })?;

        self.slot = Slot::Running { stop_flag, thread };
        Ok(())
    }

    /// Signal the thread to stop and join it.
    ///
    /// Safe to call when the thread never started or was already stopped.
    pub fn stop(&mut self) {
        let (stop_flag, thread) = match std::mem::replace(&mut self.slot, Slot::Lost(LostReason::Taken)) {
            Slot::Running { stop_flag, thread } => (stop_flag, thread),
            other => {
                self.slot = other;
                return;
            }
        };

        stop_flag.store(true, Ordering::Relaxed);
        match thread.join() {
            Ok((core, io)) => self.slot = Slot::Idle(core, io),
            Err(_) => {
                log::error!("Device '{}' communication thread panicked", self.name);
                self.slot = Slot::Lost(LostReason::Panicked);
            }
        }
    }
}

impl<Io> Drop for DeviceThread<Io> {
    fn drop(&mut self) {
        if let Slot::Running { stop_flag, .. } = &self.slot {
            stop_flag.store(true, Ordering::Relaxed);
        }
        if let Slot::Running { thread, .. } = std::mem::replace(&mut self.slot, Slot::Lost(LostReason::Taken)) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::manager::Manager;
    use crate::types::FeatureLayout;
    use std::time::Duration;

    fn idle_thread() -> (Arc<Manager>, DeviceThread<u32>) {
        let manager = Manager::new(ManagerConfig::default());
        let core = DeviceCore::new("test", &manager, &FeatureLayout::new(0, 1, 0));
        manager.finalize();
        (manager, DeviceThread::new(core, 0))
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let (_manager, mut thread) = idle_thread();
        thread.stop();
        thread.stop();
        assert!(!thread.is_running());
        assert!(thread.core_mut().is_some());
    }

    #[test]
    fn test_start_stop_restart_keeps_state() {
        let (manager, mut thread) = idle_thread();
        let events = manager.events();

        for _ in 0..2 {
            thread
                .start(|_core, count, stop| {
                    *count += 1;
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                })
                .unwrap();
            assert!(thread.is_running());
            // A second start while running is ignored.
            thread.start(|_, _, _| Ok(())).unwrap();
            thread.stop();
            thread.stop();
        }

        assert_eq!(thread.io_mut().copied(), Some(2));
        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                DeviceEvent::Started { device: "test".into() },
                DeviceEvent::Stopped { device: "test".into() },
                DeviceEvent::Started { device: "test".into() },
                DeviceEvent::Stopped { device: "test".into() },
            ]
        );
    }

    #[test]
    fn test_failure_is_reported_and_device_restartable() {
        let (manager, mut thread) = idle_thread();
        let events = manager.events();

        thread
            .start(|_, _, _| {
                Err(DeviceError::Io(std::io::Error::from(
                    std::io::ErrorKind::BrokenPipe,
                )))
            })
            .unwrap();

        let failed = events
            .iter()
            .find(|e| matches!(e, DeviceEvent::Failed { .. }))
            .unwrap();
        assert!(matches!(failed, DeviceEvent::Failed { device, .. } if device == "test"));

        // Wait for the thread to hand its state back.
        while thread.is_running() {
            std::thread::sleep(Duration::from_millis(1));
        }
        thread.start(|_, _, _| Ok(())).unwrap();
        thread.stop();
        assert!(thread.core_mut().is_some());
    }

    #[test]
    fn test_panicking_thread_is_lost() {
        let (_manager, mut thread) = idle_thread();
        thread.start(|_, _, _| panic!("driver bug")).unwrap();
        thread.stop();
        assert!(thread.core_mut().is_none());
        match thread.start(|_, _, _| Ok(())) {
            Err(e @ DeviceError::ThreadLost { .. }) => {
                assert!(e.to_string().contains("panicked"), "{}", e);
            }
            other => panic!("expected lost thread, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_spawn_failure_is_not_reported_as_panic() {
        let (_manager, mut thread) = idle_thread();
        thread.slot = Slot::Lost(LostReason::SpawnFailed);
        match thread.start(|_, _, _| Ok(())) {
            Err(e @ DeviceError::ThreadLost { .. }) => {
                let message = e.to_string();
                assert!(message.contains("could not be spawned"), "{}", message);
                assert!(!message.contains("panicked"), "{}", message);
            }
            other => panic!("expected lost thread, got {:?}", other.err()),
        }
        // The reason survives repeated attempts.
        assert!(matches!(thread.slot, Slot::Lost(LostReason::SpawnFailed)));
    }
}
