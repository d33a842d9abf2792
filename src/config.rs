//! Daemon configuration
//!
//! Stored as TOML at `~/.config/hid-passthru/config.toml`. Every field has a
//! default, so a missing file or section is not an error. Command-line
//! options override what is loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PassthruError, Result};
use crate::hogp::GAP_GAMEPAD;
use crate::relay::RelayTiming;

/// Flush timing of the BLE relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Longest delay before a pending report is sent regardless of content
    pub flush_interval_ms: u64,
    /// Minimum spacing of filter-triggered flushes
    pub flush_throttle_ms: u64,
    /// Upper bound on one wait for device input
    pub poll_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 250,
            flush_throttle_ms: 20,
            poll_interval_ms: 4,
        }
    }
}

impl RelayConfig {
    pub fn timing(&self) -> RelayTiming {
        RelayTiming {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            flush_throttle: Duration::from_millis(self.flush_throttle_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Bluetooth LE peripheral settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// D-Bus object path of the GATT application
    pub object_path: String,
    /// Advertised local name
    pub local_name: String,
    /// GAP appearance
    pub appearance: u16,
    /// Adapter index, `hciN`
    pub hci: Option<u32>,
    /// UPower device whose charge is relayed
    pub battery: String,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            object_path: "/org/hid_passthru".to_string(),
            local_name: "USB Gamepad".to_string(),
            appearance: GAP_GAMEPAD,
            hci: None,
            battery: "battery_BAT1".to_string(),
        }
    }
}

/// USB gadget settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    /// configfs `usb_gadget` directory
    pub configfs: PathBuf,
    /// Device controller to bind, first available when unset
    pub udc: Option<String>,
    /// `report_length` of each HID function
    pub report_length: usize,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            configfs: PathBuf::from("/sys/kernel/config/usb_gadget"),
            udc: None,
            report_length: 64,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthruConfig {
    pub relay: RelayConfig,
    pub ble: BleConfig,
    pub gadget: GadgetConfig,
}

impl PassthruConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hid-passthru")
            .join("config.toml")
    }

    /// Load config from a file, or return default if not found
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| PassthruError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
