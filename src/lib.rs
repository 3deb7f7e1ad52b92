//! # vrdevice - VR device daemon core
//!
//! Aggregates trackers, buttons and valuators from many physical devices into
//! one logical namespace. Provides:
//! - A feature namespace allocated once at setup and frozen afterwards
//! - One communication thread per device with calibration, post-transform
//!   and velocity estimation in shared base logic
//! - Grid-based trilinear tracker calibration
//! - An update-cycle protocol that wakes consumers once every tracker has
//!   reported, so snapshots never mix samples across cycles
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use parking_lot::Condvar;
//! use vrdevice::{ChannelDevice, DeviceManager, FeatureLayout, ManagerConfig, RawReport};
//!
//! let mut daemon = DeviceManager::new(ManagerConfig::default());
//! let (device, reports) = ChannelDevice::new("tracker", daemon.manager(), &FeatureLayout::new(1, 2, 0));
//! daemon.add_device(Box::new(device));
//! daemon.start();
//!
//! let cond = Arc::new(Condvar::new());
//! daemon.manager().enable_tracker_update_notification(cond.clone());
//! reports.send(RawReport::EndOfCycle).unwrap();
//!
//! let mut state = daemon.manager().lock_state();
//! state.wait_for_update(&cond, Some(Duration::from_secs(1)));
//! println!("head at {:?}", state.state().tracker(0).position);
//! ```

pub mod calibration;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod manager;
pub mod namespace;
pub mod state;
pub mod types;
pub mod virtual_device;

pub use calibration::{CalibrationGrid, Calibrator, CalibratorRegistry, GridCalibrator, TransformCalibrator};
pub use config::{DaemonConfig, DeviceConfig, ManagerConfig};
pub use daemon::DeviceManager;
pub use device::{ChannelDevice, Device, DeviceCore, HidDevice, HidReportDecoder, PollDevice, Poller};
pub use error::DeviceError;
pub use manager::{CycleWait, DeviceEvent, Health, Manager, StateGuard};
pub use namespace::{FeatureKind, LogicalNamespace};
pub use state::{BitMask, DeviceState};
pub use types::*;
pub use virtual_device::VirtualDevice;

/// Result type alias for vrdevice operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
