// CLI definitions using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use hid_passthru::daemon::Outputs;

#[derive(Parser)]
#[command(name = "hid-passthru")]
#[command(
    author,
    version,
    about = "Relay a USB HID device over Bluetooth LE and/or a USB gadget"
)]
pub struct Cli {
    /// USB bus id as listed in /sys/bus/usb/devices (e.g. 1-3), or VID:PID
    #[arg(value_name = "DEVICE")]
    pub device: String,

    /// Name used in system paths (gadget directory, D-Bus object path)
    #[arg(short, long)]
    pub name: Option<String>,

    /// UPower battery whose level is reported
    #[arg(short, long, value_name = "BAT")]
    pub battery: Option<String>,

    /// Index of the HCI to use
    #[arg(short = 'i', long, value_name = "INDEX")]
    pub hci: Option<u32>,

    /// Config file (default: ~/.config/hid-passthru/config.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// USB device controller for the gadget
    #[arg(long, value_name = "UDC")]
    pub udc: Option<String>,

    /// Where to relay the device
    #[arg(short, long, value_enum, default_value_t = Mode::Ble)]
    pub mode: Mode,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log debug messages
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Default)]
pub enum Mode {
    /// Bluetooth LE HID-over-GATT peripheral
    #[default]
    Ble,
    /// USB gadget through configfs
    Usb,
    /// Both at once
    Both,
}

impl Mode {
    pub fn outputs(self) -> Outputs {
        Outputs {
            ble: matches!(self, Mode::Ble | Mode::Both),
            usb: matches!(self, Mode::Usb | Mode::Both),
        }
    }
}

impl Cli {
    /// Default log level for `tracing_subscriber`
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["hid-passthru", "28de:1205"]).unwrap();
        assert_eq!(cli.device, "28de:1205");
        assert_eq!(cli.mode, Mode::Ble);
        assert_eq!(cli.log_level(), "info");
        assert_eq!(
            cli.mode.outputs(),
            Outputs {
                ble: true,
                usb: false
            }
        );
    }

    #[test]
    fn test_options() {
        let cli = Cli::try_parse_from([
            "hid-passthru",
            "-n",
            "deck",
            "-i",
            "1",
            "-m",
            "both",
            "-v",
            "1-3",
        ])
        .unwrap();
        assert_eq!(cli.name.as_deref(), Some("deck"));
        assert_eq!(cli.hci, Some(1));
        assert_eq!(cli.log_level(), "debug");
        assert_eq!(
            cli.mode.outputs(),
            Outputs {
                ble: true,
                usb: true
            }
        );
    }

    #[test]
    fn test_device_required() {
        assert!(Cli::try_parse_from(["hid-passthru"]).is_err());
        assert!(Cli::try_parse_from(["hid-passthru", "-q", "-v", "1-3"]).is_err());
    }
}
