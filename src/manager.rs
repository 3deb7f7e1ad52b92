//! Shared device state and the update-cycle notification protocol.
//!
//! Every device thread writes through the [`Manager`] under one mutex. A
//! tracker bit is set in the report mask on each tracker write; when a device
//! calls [`Manager::update_state`] and every expected tracker has reported,
//! the cycle completes, the mask resets and a registered condition variable is
//! broadcast. Consumers wait on that condition variable to read a snapshot in
//! which no tracker is older than the previous cycle.

use crate::config::ManagerConfig;
use crate::namespace::{FeatureKind, LogicalNamespace};
use crate::state::{BitMask, DeviceState};
use crate::types::{FeatureRange, TrackerState};
use crate::virtual_device::VirtualDevice;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Lifecycle notifications from device threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Started { device: String },
    Stopped { device: String },
    /// The device's thread ended on an unrecoverable error and no longer
    /// publishes state.
    Failed { device: String, error: String },
}

/// Liveness of the update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// The manager has not been finalized yet.
    Initializing,
    Live,
    /// No cycle completed within the configured stall timeout.
    Stalled { since: Duration },
}

/// Outcome of [`StateGuard::wait_for_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleWait {
    /// A cycle completed; carries the new cycle number.
    Completed(u64),
    TimedOut,
}

struct Setup {
    namespace: LogicalNamespace,
    virtual_devices: Vec<VirtualDevice>,
}

struct Frozen {
    namespace: LogicalNamespace,
    virtual_devices: Vec<VirtualDevice>,
}

struct SharedState {
    state: DeviceState,
    tracker_report_mask: BitMask,
    full_tracker_report_mask: BitMask,
    notification: Option<Arc<Condvar>>,
    cycle: u64,
    last_cycle: Instant,
    stall_reported: bool,
}

/// Owner of the feature namespace, the shared device state and the
/// virtual device list.
pub struct Manager {
    config: ManagerConfig,
    epoch: Instant,
    setup: Mutex<Setup>,
    frozen: OnceLock<Frozen>,
    shared: Mutex<SharedState>,
    event_tx: Sender<DeviceEvent>,
    event_rx: Receiver<DeviceEvent>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (event_tx, event_rx) = crossbeam_channel::bounded(config.event_capacity.max(1));
        let now = Instant::now();
        Arc::new(Self {
            config,
            epoch: now,
            setup: Mutex::new(Setup {
                namespace: LogicalNamespace::new(),
                virtual_devices: Vec::new(),
            }),
            frozen: OnceLock::new(),
            shared: Mutex::new(SharedState {
                state: DeviceState::default(),
                tracker_report_mask: BitMask::default(),
                full_tracker_report_mask: BitMask::default(),
                notification: None,
                cycle: 0,
                last_cycle: now,
                stall_reported: false,
            }),
            event_tx,
            event_rx,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Microseconds since the manager was created.
    pub fn timestamp_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    // -- Setup phase --

    fn assert_setup(&self, what: &str) {
        assert!(
            self.frozen.get().is_none(),
            "cannot {} after the device manager was finalized",
            what
        );
    }

    pub fn add_tracker(&self, name: Option<&str>) -> usize {
        self.assert_setup("add a tracker");
        self.setup.lock().namespace.add_tracker(name)
    }

    pub fn add_button(&self, name: Option<&str>) -> usize {
        self.assert_setup("add a button");
        self.setup.lock().namespace.add_button(name)
    }

    pub fn add_valuator(&self, name: Option<&str>) -> usize {
        self.assert_setup("add a valuator");
        self.setup.lock().namespace.add_valuator(name)
    }

    /// Allocate `count` consecutive indices of `kind` in one step.
    ///
    /// `names` may be shorter than `count`; the remaining features are unnamed.
    pub fn add_features(&self, kind: FeatureKind, count: usize, names: &[String]) -> FeatureRange {
        self.assert_setup("add features");
        let mut setup = self.setup.lock();
        let base = setup.namespace.count(kind);
        for i in 0..count {
            setup.namespace.add(kind, names.get(i).map(String::as_str));
        }
        FeatureRange { base, count }
    }

    /// Register a virtual device; returns its index.
    pub fn add_virtual_device(&self, device: VirtualDevice) -> usize {
        self.assert_setup("add a virtual device");
        let mut setup = self.setup.lock();
        log::debug!("Registered virtual device '{}'", device.name);
        setup.virtual_devices.push(device);
        setup.virtual_devices.len() - 1
    }

    /// Freeze the namespace and allocate the shared state arrays.
    ///
    /// Must be called once, after every device has been constructed and
    /// before any device thread starts. Later calls are ignored.
    pub fn finalize(&self) {
        let mut setup = self.setup.lock();
        if self.frozen.get().is_some() {
            return;
        }
        setup.namespace.freeze();
        let namespace = setup.namespace.clone();
        let virtual_devices = std::mem::take(&mut setup.virtual_devices);

        {
            let mut shared = self.shared.lock();
            shared.state = DeviceState::new(
                namespace.num_trackers(),
                namespace.num_buttons(),
                namespace.num_valuators(),
            );
            shared.tracker_report_mask = BitMask::new(namespace.num_trackers());
            shared.full_tracker_report_mask = BitMask::full(namespace.num_trackers());
            shared.last_cycle = Instant::now();
        }

        log::info!(
            "Feature namespace frozen: {} trackers, {} buttons, {} valuators, {} virtual devices",
            namespace.num_trackers(),
            namespace.num_buttons(),
            namespace.num_valuators(),
            virtual_devices.len()
        );

        let _ = self.frozen.set(Frozen {
            namespace,
            virtual_devices,
        });
    }

    pub fn is_finalized(&self) -> bool {
        self.frozen.get().is_some()
    }

    // -- Namespace queries --

    fn with_namespace<R>(&self, f: impl FnOnce(&LogicalNamespace) -> R) -> R {
        match self.frozen.get() {
            Some(frozen) => f(&frozen.namespace),
            None => f(&self.setup.lock().namespace),
        }
    }

    pub fn num_trackers(&self) -> usize {
        self.with_namespace(|ns| ns.num_trackers())
    }

    pub fn num_buttons(&self) -> usize {
        self.with_namespace(|ns| ns.num_buttons())
    }

    pub fn num_valuators(&self) -> usize {
        self.with_namespace(|ns| ns.num_valuators())
    }

    pub fn tracker_index(&self, name: &str) -> Option<usize> {
        self.with_namespace(|ns| ns.index_of(FeatureKind::Tracker, name))
    }

    pub fn button_index(&self, name: &str) -> Option<usize> {
        self.with_namespace(|ns| ns.index_of(FeatureKind::Button, name))
    }

    pub fn valuator_index(&self, name: &str) -> Option<usize> {
        self.with_namespace(|ns| ns.index_of(FeatureKind::Valuator, name))
    }

    pub fn feature_name(&self, kind: FeatureKind, index: usize) -> Option<String> {
        self.with_namespace(|ns| ns.name(kind, index).map(str::to_owned))
    }

    // -- Virtual devices (read-only after finalize) --

    pub fn virtual_devices(&self) -> &[VirtualDevice] {
        self.frozen
            .get()
            .map(|f| f.virtual_devices.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_virtual_devices(&self) -> usize {
        self.virtual_devices().len()
    }

    pub fn virtual_device(&self, index: usize) -> &VirtualDevice {
        &self.virtual_devices()[index]
    }

    // -- State writers, called from device threads --

    fn lock_running(&self) -> MutexGuard<'_, SharedState> {
        assert!(
            self.is_finalized(),
            "device state written before the device manager was finalized"
        );
        self.shared.lock()
    }

    pub fn set_tracker_state(&self, index: usize, state: TrackerState) {
        let mut shared = self.lock_running();
        shared.state.set_tracker(index, state);
        shared.tracker_report_mask.set(index, true);
    }

    pub fn set_button_state(&self, index: usize, pressed: bool) {
        self.lock_running().state.set_button(index, pressed);
    }

    pub fn set_valuator_state(&self, index: usize, value: f64) {
        self.lock_running().state.set_valuator(index, value);
    }

    /// Mark the end of one device's sampling batch.
    ///
    /// Completes the cycle if every tracker has reported since the last one.
    pub fn update_state(&self) {
        let mut shared = self.lock_running();
        if shared.tracker_report_mask == shared.full_tracker_report_mask {
            shared.tracker_report_mask.clear();
            shared.cycle += 1;
            if shared.stall_reported {
                shared.stall_reported = false;
                log::info!(
                    "Update cycles resumed after {:?}",
                    shared.last_cycle.elapsed()
                );
            }
            shared.last_cycle = Instant::now();
            log::trace!("Update cycle {} complete", shared.cycle);
            if let Some(cond) = &shared.notification {
                cond.notify_all();
            }
        }
    }

    // -- Consumer side --

    /// Broadcast `cond` whenever a cycle completes.
    ///
    /// Consumers wait on it through [`StateGuard::wait_for_update`].
    pub fn enable_tracker_update_notification(&self, cond: Arc<Condvar>) {
        self.shared.lock().notification = Some(cond);
    }

    pub fn disable_tracker_update_notification(&self) {
        self.shared.lock().notification = None;
    }

    pub fn tracker_update_notification_enabled(&self) -> bool {
        self.shared.lock().notification.is_some()
    }

    /// Lock the shared state; dropping the guard unlocks it.
    pub fn lock_state(&self) -> StateGuard<'_> {
        StateGuard {
            shared: self.shared.lock(),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.shared.lock().cycle
    }

    /// Liveness of the update cycle. A stall is logged once, when first
    /// observed.
    pub fn health(&self) -> Health {
        if !self.is_finalized() {
            return Health::Initializing;
        }
        let mut shared = self.shared.lock();
        let since = shared.last_cycle.elapsed();
        if since <= self.config.stall_timeout() {
            return Health::Live;
        }
        if !shared.stall_reported {
            shared.stall_reported = true;
            log::warn!(
                "No update cycle completed for {:?} (last cycle {})",
                since,
                shared.cycle
            );
        }
        Health::Stalled { since }
    }

    /// Receiver for device lifecycle events. All receivers share one queue.
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.event_rx.clone()
    }

    pub(crate) fn report_event(&self, event: DeviceEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::trace!("Device event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Locked view of the shared device state.
pub struct StateGuard<'a> {
    shared: MutexGuard<'a, SharedState>,
}

impl StateGuard<'_> {
    pub fn state(&self) -> &DeviceState {
        &self.shared.state
    }

    /// Number of completed cycles.
    pub fn cycle(&self) -> u64 {
        self.shared.cycle
    }

    /// Release the lock for one wait on `cond`; the lock is held again on
    /// return. Returns `false` if `timeout` elapsed without a notification.
    ///
    /// Unlike [`wait_for_update`](Self::wait_for_update) this does not check
    /// that a cycle completed.
    pub fn wait_notified(&mut self, cond: &Condvar, timeout: Duration) -> bool {
        !cond.wait_for(&mut self.shared, timeout).timed_out()
    }

    /// Release the lock and block on `cond` until the next cycle completes
    /// or `timeout` elapses; the lock is held again on return.
    ///
    /// `cond` must be the condition variable registered through
    /// [`Manager::enable_tracker_update_notification`]. Spurious wakeups are
    /// absorbed.
    pub fn wait_for_update(&mut self, cond: &Condvar, timeout: Option<Duration>) -> CycleWait {
        let start = self.shared.cycle;
        let deadline = timeout.map(|t| Instant::now() + t);
        while self.shared.cycle == start {
            match deadline {
                Some(deadline) => {
                    if cond.wait_until(&mut self.shared, deadline).timed_out() {
                        if self.shared.cycle == start {
                            return CycleWait::TimedOut;
                        }
                        break;
                    }
                }
                None => cond.wait(&mut self.shared),
            }
        }
        CycleWait::Completed(self.shared.cycle)
    }
}
