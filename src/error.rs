//! Daemon error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while discovering, provisioning or relaying a device
#[derive(Error, Debug)]
pub enum PassthruError {
    // Discovery
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device name {0:?}: must not contain '/' or start with '.'")]
    InvalidName(String),

    #[error("Failed to parse {path}: {reason}")]
    Sysfs { path: PathBuf, reason: String },

    #[error("No hidraw node for interface {0}")]
    NoHidraw(usize),

    #[error("Report descriptor of interface {0} is empty")]
    EmptyReportDescriptor(usize),

    // Device I/O
    #[error("Device disconnected")]
    Disconnected,

    #[error("Invalid report filter: {0}")]
    InvalidFilter(String),

    // Gadget
    #[error("No USB device controller available")]
    NoUdc,

    #[error("Gadget {0} already exists")]
    GadgetExists(PathBuf),

    // Config
    #[error("Config error: {0}")]
    Config(String),

    // Bluetooth
    #[error(transparent)]
    Gatt(#[from] passthru_gatt::GattError),

    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PassthruError {
    pub(crate) fn sysfs(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PassthruError::Sysfs {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PassthruError>;
