// USB HID passthru daemon - shared library
// Device discovery, report relaying, HOGP model, USB gadget and BlueZ glue

pub mod battery;
pub mod bluez;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod gadget;
pub mod hidraw;
pub mod hogp;
pub mod relay;
pub mod shutdown;

pub use config::PassthruConfig;
pub use discovery::{HidInterface, Sysfs, UsbDevice};
pub use error::{PassthruError, Result};
pub use filter::{filter_for, AnalogChannel, ReportFilter};
pub use hidraw::{HidrawNode, ReportNode};
pub use hogp::{HogpDevice, HogpInterface, InterfaceSource, PnpId};
pub use relay::{FlushReason, Relay, RelayState, RelayTiming};
pub use shutdown::ShutdownContext;
