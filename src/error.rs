/// Errors raised while constructing devices, loading calibration data or
/// reading configuration.
///
/// Errors on an already running device thread never surface through this type
/// to callers of the shared-state API; they end that device's thread and are
/// reported as [`DeviceEvent::Failed`](crate::manager::DeviceEvent::Failed).
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device not found (VID={vendor_id:04X} PID={product_id:04X})")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("Calibration data error at line {line}: {message}")]
    Calibration { line: usize, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed configuration file: {0}")]
    ConfigSyntax(#[from] toml::de::Error),

    #[error("Unknown calibrator '{0}'")]
    UnknownCalibrator(String),

    #[error("Failed to spawn device thread: {0}")]
    ThreadSpawn(String),

    /// The device's core was lost with its thread; `reason` says how.
    #[error("Device '{device}' cannot be restarted: {reason}")]
    ThreadLost { device: String, reason: String },
}

impl DeviceError {
    pub(crate) fn calibration(line: usize, message: impl Into<String>) -> Self {
        DeviceError::Calibration {
            line,
            message: message.into(),
        }
    }

    /// Whether a failed blocking read should simply be retried.
    ///
    /// hidapi's C backends report read failures only as text (the
    /// platform's `strerror` for `hid_read_timeout`), so those are matched
    /// by message.
    pub fn is_transient(&self) -> bool {
        match self {
            DeviceError::Io(e) => is_transient_io(e),
            DeviceError::Hid(hidapi::HidError::IoError { error }) => is_transient_io(error),
            DeviceError::Hid(hidapi::HidError::HidApiError { message }) => {
                is_transient_message(message)
            }
            _ => false,
        }
    }
}

fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["interrupted", "temporarily unavailable", "timed out"]
        .iter()
        .any(|pattern| message.contains(pattern))
}

fn is_transient_io(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}
