//! USB gadget mirror of the source device through configfs
//!
//! The gadget copies the device descriptor fields and string descriptors of
//! the source device and gets one `hid` function per HID interface. Every
//! directory and link created is recorded so teardown can undo exactly that,
//! in reverse order.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::GadgetConfig;
use crate::discovery::{validate_name, HidInterface, Sysfs, UsbDevice};
use crate::error::{PassthruError, Result};

const CONFIG: &str = "configs/c.1";
const STRINGS: &str = "strings/0x409";

/// Convert sysfs `version` (` 2.00`) to a configfs `bcdUSB` value (`0x0200`)
pub fn bcd_usb(version: &str) -> Option<String> {
    let (major, minor) = version.trim().split_once('.')?;
    let major: u8 = major.parse().ok()?;
    if major > 9 || minor.len() != 2 || !minor.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("0x0{major}{minor}"))
}

/// Strip the unit from sysfs `bMaxPower` (`500mA` to `500`)
pub fn max_power(text: &str) -> Option<String> {
    let milliamps = text.trim().strip_suffix("mA")?;
    if milliamps.is_empty() || !milliamps.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(milliamps.to_string())
}

/// Parse a `dev` attribute (`major:minor`)
pub fn parse_dev_numbers(text: &str) -> Option<(u32, u32)> {
    let (major, minor) = text.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// First device controller listed in `/sys/class/udc`
pub fn find_udc(sysfs: &Sysfs) -> Result<String> {
    let mut names: Vec<String> = fs::read_dir(sysfs.class_dir("udc"))
        .map_err(|_| PassthruError::NoUdc)?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names.into_iter().next().ok_or(PassthruError::NoUdc)
}

fn read_attr(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| PassthruError::sysfs(path, e))
}

#[derive(Debug)]
enum Entry {
    Dir(PathBuf),
    Link(PathBuf),
}

/// A provisioned configfs gadget
#[derive(Debug)]
pub struct Gadget {
    path: PathBuf,
    created: Vec<Entry>,
    functions: Vec<usize>,
    bound: bool,
}

impl Gadget {
    /// Create `<configfs>/<name>` mirroring `dev` with one function per entry
    /// of `interfaces`
    pub fn create(
        config: &GadgetConfig,
        name: &str,
        dev: &UsbDevice,
        interfaces: &[HidInterface],
    ) -> Result<Self> {
        validate_name(name)?;
        let path = config.configfs.join(name);
        if path.exists() {
            return Err(PassthruError::GadgetExists(path));
        }

        let mut gadget = Self {
            path,
            created: Vec::new(),
            functions: Vec::new(),
            bound: false,
        };
        // On error the partial gadget is removed by Drop
        gadget.populate(config, dev, interfaces)?;
        info!(
            "Created gadget {} with {} HID functions",
            gadget.path.display(),
            gadget.functions.len()
        );
        Ok(gadget)
    }

    fn populate(
        &mut self,
        config: &GadgetConfig,
        dev: &UsbDevice,
        interfaces: &[HidInterface],
    ) -> Result<()> {
        let src = &dev.syspath;

        self.mkdir(Path::new(""))?;
        self.mkdir(Path::new(CONFIG))?;
        self.mkdir(Path::new(STRINGS))?;
        self.mkdir(&Path::new(CONFIG).join(STRINGS))?;

        self.copy_attr(&src.join("bDeviceProtocol"), "bDeviceProtocol")?;
        self.copy_attr(&src.join("bDeviceSubClass"), "bDeviceSubClass")?;
        self.write_attr("idVendor", &format!("0x{:04x}", dev.vid))?;
        self.write_attr("idProduct", &format!("0x{:04x}", dev.pid))?;
        self.write_attr("bcdDevice", &format!("0x{:04x}", dev.bcd_device))?;

        let version_path = src.join("version");
        let version = read_attr(&version_path)?;
        let bcd = bcd_usb(&version)
            .ok_or_else(|| PassthruError::sysfs(&version_path, "unrecognized USB version"))?;
        self.write_attr("bcdUSB", &bcd)?;

        let power_path = src.join("bMaxPower");
        let power = read_attr(&power_path)?;
        let power = max_power(&power)
            .ok_or_else(|| PassthruError::sysfs(&power_path, "unrecognized max power"))?;
        self.write_attr(&format!("{CONFIG}/MaxPower"), &power)?;

        // Devices often lack some string descriptors
        for (attr, target) in [
            ("manufacturer", format!("{STRINGS}/manufacturer")),
            ("product", format!("{STRINGS}/product")),
            ("serial", format!("{STRINGS}/serialnumber")),
            ("configuration", format!("{CONFIG}/{STRINGS}/configuration")),
        ] {
            let path = src.join(attr);
            if !path.exists() {
                debug!("No {attr} string on source device");
                continue;
            }
            self.copy_attr(&path, &target)?;
        }

        for iface in interfaces {
            self.add_function(config, iface)?;
        }
        Ok(())
    }

    fn add_function(&mut self, config: &GadgetConfig, iface: &HidInterface) -> Result<()> {
        let function = format!("functions/hid.usb{}", iface.index);
        self.mkdir(Path::new(&function))?;

        self.copy_attr(
            &iface.syspath.join("bInterfaceProtocol"),
            &format!("{function}/protocol"),
        )?;
        self.copy_attr(
            &iface.syspath.join("bInterfaceSubClass"),
            &format!("{function}/subclass"),
        )?;
        fs::write(
            self.path.join(&function).join("report_desc"),
            &iface.report_descriptor,
        )?;
        self.write_attr(
            &format!("{function}/report_length"),
            &config.report_length.to_string(),
        )?;

        let link = self.path.join(CONFIG).join(format!("hid.usb{}", iface.index));
        std::os::unix::fs::symlink(self.path.join(&function), &link)?;
        self.created.push(Entry::Link(link));
        self.functions.push(iface.index);
        Ok(())
    }

    fn mkdir(&mut self, rel: &Path) -> Result<()> {
        let dir = self.path.join(rel);
        fs::create_dir_all(&dir)?;
        self.created.push(Entry::Dir(dir));
        Ok(())
    }

    fn copy_attr(&self, from: &Path, to: &str) -> Result<()> {
        let value = fs::read(from).map_err(|e| PassthruError::sysfs(from, e))?;
        fs::write(self.path.join(to), value)?;
        Ok(())
    }

    fn write_attr(&self, rel: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(rel), format!("{value}\n"))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// USB interface numbers that got a function, in creation order
    pub fn functions(&self) -> &[usize] {
        &self.functions
    }

    pub fn function_path(&self, index: usize) -> PathBuf {
        self.path.join(format!("functions/hid.usb{index}"))
    }

    /// Attach the gadget to device controller `udc`
    pub fn bind(&mut self, udc: &str) -> Result<()> {
        fs::write(self.path.join("UDC"), format!("{udc}\n"))?;
        self.bound = true;
        info!("Bound gadget to {udc}");
        Ok(())
    }

    pub fn unbind(&mut self) {
        if !self.bound {
            return;
        }
        if let Err(e) = fs::write(self.path.join("UDC"), "\n") {
            warn!("Failed to unbind gadget: {e}");
        }
        self.bound = false;
    }

    /// `/dev/hidgN` node of the function for interface `index`
    pub fn hidg_node(&self, sysfs: &Sysfs, index: usize) -> Result<PathBuf> {
        let dev_attr = self.function_path(index).join("dev");
        let text = read_attr(&dev_attr)?;
        let (major, minor) = parse_dev_numbers(&text)
            .ok_or_else(|| PassthruError::sysfs(&dev_attr, "malformed device number"))?;

        let dev_dir = sysfs.dev_dir();
        for entry in fs::read_dir(&dev_dir)?.flatten() {
            if !entry.file_name().to_string_lossy().starts_with("hidg") {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.file_type().is_char_device() {
                continue;
            }
            let rdev = meta.rdev() as libc::dev_t;
            if libc::major(rdev) == major && libc::minor(rdev) == minor {
                return Ok(entry.path());
            }
        }
        Err(PassthruError::DeviceNotFound(format!(
            "hidg node {major}:{minor} for interface {index}"
        )))
    }

    /// Unbind and remove everything created, best effort
    pub fn teardown(&mut self) {
        self.unbind();
        while let Some(entry) = self.created.pop() {
            let result = match &entry {
                Entry::Link(path) => fs::remove_file(path),
                Entry::Dir(path) => fs::remove_dir(path),
            };
            if let Err(e) = result {
                debug!("Could not remove {entry:?}: {e}");
            }
        }
        self.functions.clear();
    }
}

impl Drop for Gadget {
    fn drop(&mut self) {
        if !self.created.is_empty() {
            self.teardown();
            debug!("Tore down gadget {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::fake_deck;
    use tempfile::TempDir;

    fn add_gadget_attrs(root: &Path) {
        let dev = root.join("sys/devices/pci0000:00/usb1/1-3");
        for (name, value) in [
            ("bDeviceProtocol", "00\n"),
            ("bDeviceSubClass", "00\n"),
            ("version", " 2.00\n"),
            ("bMaxPower", "500mA\n"),
            ("manufacturer", "Valve Software\n"),
            ("product", "Steam Deck Controller\n"),
        ] {
            fs::write(dev.join(name), value).unwrap();
        }
        for index in [0, 2] {
            let iface = dev.join(format!("1-3:1.{index}"));
            fs::write(iface.join("bInterfaceProtocol"), "00\n").unwrap();
            fs::write(iface.join("bInterfaceSubClass"), "00\n").unwrap();
        }
    }

    #[test]
    fn test_bcd_usb() {
        assert_eq!(bcd_usb(" 2.00\n").as_deref(), Some("0x0200"));
        assert_eq!(bcd_usb(" 1.10").as_deref(), Some("0x0110"));
        assert_eq!(bcd_usb("3.20").as_deref(), Some("0x0320"));
        assert_eq!(bcd_usb("2.0"), None);
        assert_eq!(bcd_usb("two"), None);
    }

    #[test]
    fn test_max_power() {
        assert_eq!(max_power("500mA\n").as_deref(), Some("500"));
        assert_eq!(max_power("0mA").as_deref(), Some("0"));
        assert_eq!(max_power("500"), None);
        assert_eq!(max_power("mA"), None);
        assert_eq!(max_power("5x0mA"), None);
    }

    #[test]
    fn test_parse_dev_numbers() {
        assert_eq!(parse_dev_numbers("236:0\n"), Some((236, 0)));
        assert_eq!(parse_dev_numbers("236"), None);
    }

    #[test]
    fn test_find_udc() {
        let root = TempDir::new().unwrap();
        let sysfs = Sysfs::new(root.path());
        assert!(matches!(find_udc(&sysfs), Err(PassthruError::NoUdc)));

        let udc = sysfs.class_dir("udc");
        fs::create_dir_all(&udc).unwrap();
        assert!(matches!(find_udc(&sysfs), Err(PassthruError::NoUdc)));

        fs::create_dir(udc.join("fe800000.usb")).unwrap();
        fs::create_dir(udc.join(".hidden")).unwrap();
        assert_eq!(find_udc(&sysfs).unwrap(), "fe800000.usb");
    }

    #[test]
    fn test_create_mirrors_device() {
        let root = fake_deck();
        add_gadget_attrs(root.path());
        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("1-3").unwrap();
        let ifaces = sysfs.hid_interfaces(&dev).unwrap();

        let config = GadgetConfig {
            configfs: root.path().join("config/usb_gadget"),
            ..GadgetConfig::default()
        };
        let mut gadget = Gadget::create(&config, "deck", &dev, &ifaces).unwrap();
        let g = gadget.path().to_path_buf();

        let read = |rel: &str| fs::read_to_string(g.join(rel)).unwrap();
        assert_eq!(read("idVendor"), "0x28de\n");
        assert_eq!(read("idProduct"), "0x1205\n");
        assert_eq!(read("bcdDevice"), "0x0200\n");
        assert_eq!(read("bcdUSB"), "0x0200\n");
        assert_eq!(read("configs/c.1/MaxPower"), "500\n");
        assert_eq!(read("strings/0x409/product"), "Steam Deck Controller\n");
        assert!(!g.join("strings/0x409/serialnumber").exists());
        assert_eq!(read("functions/hid.usb2/report_length"), "64\n");
        assert_eq!(
            fs::read(g.join("functions/hid.usb2/report_desc")).unwrap(),
            vec![0x06, 0xFF, 0xFF, 0x09, 0x01, 2]
        );
        assert!(!g.join("functions/hid.usb1").exists());
        assert_eq!(gadget.functions(), &[0, 2]);

        let link = g.join("configs/c.1/hid.usb0");
        assert_eq!(fs::read_link(&link).unwrap(), g.join("functions/hid.usb0"));

        gadget.bind("dummy_udc.0").unwrap();
        assert_eq!(read("UDC"), "dummy_udc.0\n");

        gadget.teardown();
        assert_eq!(read("UDC"), "\n");
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn test_existing_gadget_is_left_alone() {
        let root = fake_deck();
        add_gadget_attrs(root.path());
        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("1-3").unwrap();

        let config = GadgetConfig {
            configfs: root.path().join("config/usb_gadget"),
            ..GadgetConfig::default()
        };
        fs::create_dir_all(config.configfs.join("deck")).unwrap();
        assert!(matches!(
            Gadget::create(&config, "deck", &dev, &[]),
            Err(PassthruError::GadgetExists(_))
        ));
        assert!(config.configfs.join("deck").exists());
    }

    #[test]
    fn test_missing_version_fails() {
        let root = fake_deck();
        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("1-3").unwrap();
        let config = GadgetConfig {
            configfs: root.path().join("config/usb_gadget"),
            ..GadgetConfig::default()
        };
        assert!(matches!(
            Gadget::create(&config, "deck", &dev, &[]),
            Err(PassthruError::Sysfs { .. })
        ));
    }

    #[test]
    fn test_hidg_node_requires_char_device() {
        let root = fake_deck();
        add_gadget_attrs(root.path());
        let sysfs = Sysfs::new(root.path());
        let dev = sysfs.resolve("1-3").unwrap();
        let ifaces = sysfs.hid_interfaces(&dev).unwrap();
        let config = GadgetConfig {
            configfs: root.path().join("config/usb_gadget"),
            ..GadgetConfig::default()
        };
        let gadget = Gadget::create(&config, "deck", &dev, &ifaces).unwrap();

        fs::write(gadget.function_path(0).join("dev"), "236:0\n").unwrap();
        fs::write(root.path().join("dev/hidg0"), "").unwrap();
        assert!(matches!(
            gadget.hidg_node(&sysfs, 0),
            Err(PassthruError::DeviceNotFound(_))
        ));
    }
}
