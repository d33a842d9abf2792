//! USB HID device discovery through sysfs
//!
//! A device is named either by its USB bus id (`1-3`, as listed in
//! `/sys/bus/usb/devices`) or by `VID:PID` (`28de:1205`). Each HID-class
//! interface is resolved to its report descriptor and hidraw node.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{PassthruError, Result};

/// Interfaces considered per device
pub const INTERFACES_MAX: usize = 8;
/// Largest report descriptor accepted
pub const DESCRIPTOR_SIZE_MAX: usize = 4096;
/// bInterfaceClass of HID interfaces
pub const HID_CLASS: u8 = 0x03;

/// Root of the sysfs/devfs hierarchy, `/` on a live system
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/")
    }
}

/// Identity of a USB device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// Canonical sysfs directory
    pub syspath: PathBuf,
    pub bus_id: String,
    pub vid: u16,
    pub pid: u16,
    pub bcd_device: u16,
    pub num_interfaces: usize,
}

/// One HID-class interface of a USB device
#[derive(Debug, Clone)]
pub struct HidInterface {
    /// USB interface number
    pub index: usize,
    /// Interface directory, `<syspath>/<bus_id>:1.<index>`
    pub syspath: PathBuf,
    pub report_descriptor: Vec<u8>,
    pub hidraw: PathBuf,
}

/// Reject names that could escape the directories they are joined onto
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(PassthruError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Parse `VVVV:PPPP`
pub fn parse_vid_pid(s: &str) -> Option<(u16, u16)> {
    let (vid, pid) = s.split_once(':')?;
    if vid.len() != 4 || pid.len() != 4 {
        return None;
    }
    Some((
        u16::from_str_radix(vid, 16).ok()?,
        u16::from_str_radix(pid, 16).ok()?,
    ))
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| PassthruError::sysfs(path, e))
}

fn read_hex(path: &Path) -> Result<u16> {
    let text = read_trimmed(path)?;
    u16::from_str_radix(&text, 16).map_err(|e| PassthruError::sysfs(path, e))
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn usb_devices(&self) -> PathBuf {
        self.root.join("sys/bus/usb/devices")
    }

    pub fn class_dir(&self, class: &str) -> PathBuf {
        self.root.join("sys/class").join(class)
    }

    pub fn dev_dir(&self) -> PathBuf {
        self.root.join("dev")
    }

    /// Resolve a bus id or `VID:PID` to a USB device
    pub fn resolve(&self, device: &str) -> Result<UsbDevice> {
        validate_name(device)?;

        let bus_id = match parse_vid_pid(device) {
            Some((vid, pid)) => self.find_by_id(vid, pid)?,
            None => device.to_string(),
        };

        let link = self.usb_devices().join(&bus_id);
        let syspath = fs::canonicalize(&link)
            .map_err(|_| PassthruError::DeviceNotFound(device.to_string()))?;

        let num_interfaces = read_trimmed(&syspath.join("bNumInterfaces"))?
            .parse::<usize>()
            .map_err(|e| PassthruError::sysfs(syspath.join("bNumInterfaces"), e))?;

        let dev = UsbDevice {
            vid: read_hex(&syspath.join("idVendor"))?,
            pid: read_hex(&syspath.join("idProduct"))?,
            bcd_device: read_hex(&syspath.join("bcdDevice"))?,
            num_interfaces,
            syspath,
            bus_id,
        };
        info!(
            "Found {:04x}:{:04x} at {} ({} interfaces)",
            dev.vid,
            dev.pid,
            dev.syspath.display(),
            dev.num_interfaces
        );
        Ok(dev)
    }

    /// Bus id of the first device matching `vid`/`pid`
    pub fn find_by_id(&self, vid: u16, pid: u16) -> Result<String> {
        let devices = self.usb_devices();
        let not_found = || PassthruError::DeviceNotFound(format!("{vid:04x}:{pid:04x}"));

        for entry in fs::read_dir(&devices).map_err(|_| not_found())?.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            // Root hubs, hidden entries and interfaces
            if name_str.starts_with("usb") || name_str.starts_with('.') || name_str.contains(':')
            {
                continue;
            }

            let path = entry.path();
            let (Ok(v), Ok(p)) = (
                read_hex(&path.join("idVendor")),
                read_hex(&path.join("idProduct")),
            ) else {
                continue;
            };
            if v == vid && p == pid {
                debug!("{vid:04x}:{pid:04x} is {name_str}");
                return Ok(name_str.into_owned());
            }
        }

        Err(not_found())
    }

    /// Directory of USB interface `index`
    pub fn interface_path(&self, dev: &UsbDevice, index: usize) -> PathBuf {
        dev.syspath.join(format!("{}:1.{}", dev.bus_id, index))
    }

    /// bInterfaceClass of USB interface `index`
    pub fn interface_class(&self, dev: &UsbDevice, index: usize) -> Result<u8> {
        let path = self.interface_path(dev, index).join("bInterfaceClass");
        let text = read_trimmed(&path)?;
        u8::from_str_radix(&text, 16).map_err(|e| PassthruError::sysfs(path, e))
    }

    /// Every HID interface of `dev`, up to [`INTERFACES_MAX`] interfaces
    pub fn hid_interfaces(&self, dev: &UsbDevice) -> Result<Vec<HidInterface>> {
        let count = dev.num_interfaces.min(INTERFACES_MAX);
        if dev.num_interfaces > INTERFACES_MAX {
            warn!(
                "Device has {} interfaces, only the first {} are relayed",
                dev.num_interfaces, INTERFACES_MAX
            );
        }

        let mut interfaces = Vec::new();
        for index in 0..count {
            if self.interface_class(dev, index)? != HID_CLASS {
                continue;
            }

            let syspath = self.interface_path(dev, index);
            let function = find_function(&syspath).ok_or_else(|| {
                PassthruError::sysfs(&syspath, "no HID function directory")
            })?;

            let report_descriptor = read_report_descriptor(&function)?;
            if report_descriptor.is_empty() {
                return Err(PassthruError::EmptyReportDescriptor(index));
            }

            let hidraw = self
                .find_hidraw(&function)
                .ok_or(PassthruError::NoHidraw(index))?;

            debug!(
                "Interface {}: {} byte report descriptor, {}",
                index,
                report_descriptor.len(),
                hidraw.display()
            );
            interfaces.push(HidInterface {
                index,
                syspath,
                report_descriptor,
                hidraw,
            });
        }

        if interfaces.is_empty() {
            return Err(PassthruError::DeviceNotFound(format!(
                "{} has no HID interfaces",
                dev.bus_id
            )));
        }
        Ok(interfaces)
    }

    /// Device node of the hidraw child of a HID function
    fn find_hidraw(&self, function: &Path) -> Option<PathBuf> {
        for entry in fs::read_dir(function.join("hidraw")).ok()?.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            if name_str.starts_with("hidraw") {
                return Some(self.dev_dir().join(&*name_str));
            }
        }
        None
    }
}

/// HID function directory (`0003:VVVV:PPPP.NNNN`) below an interface
pub fn find_function(interface: &Path) -> Option<PathBuf> {
    fs::read_dir(interface)
        .ok()?
        .flatten()
        .find(|entry| {
            entry.file_name().to_string_lossy().starts_with("0003:")
                && entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
        })
        .map(|entry| entry.path())
}

fn read_report_descriptor(function: &Path) -> Result<Vec<u8>> {
    let path = function.join("report_descriptor");
    let mut data = fs::read(&path).map_err(|e| PassthruError::sysfs(&path, e))?;
    if data.len() > DESCRIPTOR_SIZE_MAX {
        warn!("Truncating {} byte report descriptor", data.len());
        data.truncate(DESCRIPTOR_SIZE_MAX);
    }
    Ok(data)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Fake `/sys` + `/dev` tree with one Steam Deck style device at `1-3`
    /// exposing HID interfaces 0 and 2 and a vendor interface 1.
    pub(crate) fn fake_deck() -> TempDir {
        let root = TempDir::new().unwrap();
        let real = root.path().join("sys/devices/pci0000:00/usb1/1-3");
        fs::create_dir_all(&real).unwrap();
        fs::create_dir_all(root.path().join("sys/bus/usb/devices")).unwrap();
        std::os::unix::fs::symlink(&real, root.path().join("sys/bus/usb/devices/1-3")).unwrap();
        fs::create_dir_all(root.path().join("sys/bus/usb/devices/usb1")).unwrap();
        fs::create_dir_all(root.path().join("dev")).unwrap();

        fs::write(real.join("idVendor"), "28de\n").unwrap();
        fs::write(real.join("idProduct"), "1205\n").unwrap();
        fs::write(real.join("bcdDevice"), "0200\n").unwrap();
        fs::write(real.join("bNumInterfaces"), " 3\n").unwrap();

        for (index, class) in [(0, "03"), (1, "ff"), (2, "03")] {
            let iface = real.join(format!("1-3:1.{index}"));
            fs::create_dir_all(&iface).unwrap();
            fs::write(iface.join("bInterfaceClass"), format!("{class}\n")).unwrap();
            if class == "03" {
                let function = iface.join(format!("0003:28DE:1205.000{index}"));
                fs::create_dir_all(function.join(format!("hidraw/hidraw{index}"))).unwrap();
                fs::write(
                    function.join("report_descriptor"),
                    [0x06, 0xFF, 0xFF, 0x09, 0x01, index as u8],
                )
                .unwrap();
            }
        }
        root
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("1-3").is_ok());
        assert!(validate_name("deck").is_ok());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_parse_vid_pid() {
        assert_eq!(parse_vid_pid("28de:1205"), Some((0x28de, 0x1205)));
        assert_eq!(parse_vid_pid("28DE:1205"), Some((0x28de, 0x1205)));
        assert_eq!(parse_vid_pid("1-3"), None);
        assert_eq!(parse_vid_pid("28de:12"), None);
        assert_eq!(parse_vid_pid("zzzz:1205"), None);
    }

    #[test]
    fn test_resolve_by_bus_id() {
        let root = fake_deck();
        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("1-3").unwrap();
        assert_eq!(dev.bus_id, "1-3");
        assert_eq!((dev.vid, dev.pid, dev.bcd_device), (0x28de, 0x1205, 0x0200));
        assert_eq!(dev.num_interfaces, 3);
        assert!(dev.syspath.ends_with("usb1/1-3"));
    }

    #[test]
    fn test_resolve_by_vid_pid() {
        let root = fake_deck();
        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("28DE:1205").unwrap();
        assert_eq!(dev.bus_id, "1-3");

        assert!(matches!(
            sysfs.resolve("046d:c21d"),
            Err(PassthruError::DeviceNotFound(_))
        ));
        assert!(matches!(
            sysfs.resolve("9-9"),
            Err(PassthruError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_hid_interfaces() {
        let root = fake_deck();
        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("1-3").unwrap();
        let ifaces = sysfs.hid_interfaces(&dev).unwrap();

        let indices: Vec<usize> = ifaces.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(ifaces[1].report_descriptor, vec![0x06, 0xFF, 0xFF, 0x09, 0x01, 2]);
        assert_eq!(ifaces[1].hidraw, root.path().join("dev/hidraw2"));
    }

    #[test]
    fn test_missing_hidraw_is_an_error() {
        let root = fake_deck();
        let hidraw = root
            .path()
            .join("sys/devices/pci0000:00/usb1/1-3/1-3:1.2/0003:28DE:1205.0002/hidraw");
        fs::remove_dir_all(hidraw).unwrap();

        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("1-3").unwrap();
        assert!(matches!(
            sysfs.hid_interfaces(&dev),
            Err(PassthruError::NoHidraw(2))
        ));
    }
}
