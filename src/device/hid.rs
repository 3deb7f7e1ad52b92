use super::thread::{DeviceThread, STOP_POLL_INTERVAL_MS, TRANSIENT_WARN_AFTER};
use super::{Device, DeviceCore};
use crate::calibration::CalibratorRegistry;
use crate::config::{DeviceConfig, HidConfig};
use crate::error::DeviceError;
use crate::manager::Manager;
use crate::types::{FeatureLayout, FeatureRanges, RawReport};
use crate::Result;
use hidapi::HidApi;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Turns HID input reports into device-local measurements.
///
/// Implementations hold whatever per-protocol state they need; the device
/// calls them only from its communication thread.
pub trait HidReportDecoder: Send {
    /// Features the decoded device provides.
    fn layout(&self) -> FeatureLayout;

    /// Decode one input report received at `timestamp_us`.
    ///
    /// A report that completes a sampling batch should end with
    /// [`RawReport::EndOfCycle`].
    fn decode(&mut self, report: &[u8], timestamp_us: u64, out: &mut Vec<RawReport>);
}

struct HidIo {
    device: hidapi::HidDevice,
    decoder: Box<dyn HidReportDecoder>,
    report_size: usize,
    read_timeout_ms: i32,
}

/// USB HID input device read through hidapi.
pub struct HidDevice {
    thread: DeviceThread<HidIo>,
}

fn matches_config(info: &hidapi::DeviceInfo, config: &HidConfig) -> bool {
    info.vendor_id() == config.vendor_id
        && info.product_id() == config.product_id
        && match &config.serial {
            Some(serial) => info.serial_number() == Some(serial.as_str()),
            None => true,
        }
}

impl HidDevice {
    /// Open the first HID device matching `config`.
    ///
    /// Features are registered with the manager only after the device was
    /// opened, so a missing device leaves the namespace untouched.
    pub fn open(
        name: impl Into<String>,
        manager: &Arc<Manager>,
        config: &HidConfig,
        decoder: Box<dyn HidReportDecoder>,
    ) -> Result<Self> {
        let name = name.into();
        let api = HidApi::new()?;
        let info = api
            .device_list()
            .find(|d| matches_config(d, config))
            .ok_or(DeviceError::DeviceNotFound {
                vendor_id: config.vendor_id,
                product_id: config.product_id,
            })?;
        let device = api.open_path(info.path())?;

        log::info!(
            "Opened HID device '{}' ({:04X}:{:04X}) at {:?}",
            name,
            config.vendor_id,
            config.product_id,
            info.path()
        );

        let core = DeviceCore::new(name, manager, &decoder.layout());
        let io = HidIo {
            device,
            decoder,
            report_size: config.report_size.max(1),
            read_timeout_ms: config.read_timeout_ms.clamp(1, STOP_POLL_INTERVAL_MS as i32),
        };
        Ok(Self {
            thread: DeviceThread::new(core, io),
        })
    }

    /// Open the device described by a configuration section with a `hid` table.
    pub fn from_config(
        manager: &Arc<Manager>,
        config: &DeviceConfig,
        calibrators: &CalibratorRegistry,
        decoder: Box<dyn HidReportDecoder>,
    ) -> Result<Self> {
        let hid = config.hid.as_ref().ok_or_else(|| {
            DeviceError::Config(format!("device '{}' has no [hid] section", config.name))
        })?;
        let mut device = Self::open(&config.name, manager, hid, decoder)?;
        if let Some(core) = device.core_mut() {
            core.configure(config, calibrators)?;
        }
        Ok(device)
    }

    pub fn core_mut(&mut self) -> Option<&mut DeviceCore> {
        self.thread.core_mut()
    }
}

/// Decode one input report and forward the results.
pub fn process_report(
    core: &mut DeviceCore,
    decoder: &mut dyn HidReportDecoder,
    report: &[u8],
    scratch: &mut Vec<RawReport>,
) {
    scratch.clear();
    decoder.decode(report, core.timestamp_us(), scratch);
    for decoded in scratch.iter() {
        core.apply(decoded);
    }
}

/// The HID reader loop runs in the device's communication thread.
///
/// Reads interrupt IN reports with a short timeout so the stop flag is
/// checked regularly.
fn hid_reader_loop(core: &mut DeviceCore, io: &mut HidIo, stop_flag: &AtomicBool) -> Result<()> {
    let mut buf = vec![0u8; io.report_size];
    let mut decoded = Vec::new();
    let mut transient = 0u32;

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return Ok(());
        }

        let len = match io.device.read_timeout(&mut buf, io.read_timeout_ms) {
            Ok(0) => continue, // timeout, no data
            Ok(n) => n,
            Err(e) => {
                let err = DeviceError::from(e);
                if err.is_transient() {
                    transient += 1;
                    if transient == TRANSIENT_WARN_AFTER {
                        log::warn!("Device '{}': {} consecutive read errors, last: {}", core.name(), transient, err);
                    } else {
                        log::trace!("Device '{}' transient read error: {}", core.name(), err);
                    }
                    continue;
                }
                return Err(err);
            }
        };

        transient = 0;
        process_report(core, io.decoder.as_mut(), &buf[..len], &mut decoded);
    }
}

impl Device for HidDevice {
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
        self.thread.start(hid_reader_loop)
    }

    fn stop(&mut self) {
        self.thread.stop();
    }

    fn is_running(&self) -> bool {
        self.thread.is_running()
    }
}
