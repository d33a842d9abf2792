//! Raw HID report access
//!
//! Reports flow through `read`/`write` on the device node, feature reports
//! through the `HIDIOCSFEATURE`/`HIDIOCGFEATURE` ioctls.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PassthruError, Result};

/// Largest input/output report relayed
pub const REPORT_SIZE_MAX: usize = 512;
/// Feature report payload, excluding the report ID byte
pub const FEATURE_REPORT_SIZE: usize = 64;

// HIDRAW ioctl definitions
// From linux/hidraw.h:
// #define HIDIOCSFEATURE(len) _IOC(_IOC_WRITE|_IOC_READ, 'H', 0x06, len)
// #define HIDIOCGFEATURE(len) _IOC(_IOC_WRITE|_IOC_READ, 'H', 0x07, len)

const HIDRAW_MAGIC: u8 = b'H';

fn hidraw_ioc(nr: u32, len: usize) -> libc::c_ulong {
    // Direction: 2 bits at 30-31, Size: 14 bits at 16-29, Type: 8 bits at 8-15, Nr: 8 bits at 0-7
    let dir: u32 = 3; // _IOC_WRITE | _IOC_READ
    let size = (len as u32) & 0x3FFF;
    let typ = HIDRAW_MAGIC as u32;
    ((dir << 30) | (size << 16) | (typ << 8) | nr) as libc::c_ulong
}

fn hidiocsfeature(len: usize) -> libc::c_ulong {
    hidraw_ioc(0x06, len)
}

fn hidiocgfeature(len: usize) -> libc::c_ulong {
    hidraw_ioc(0x07, len)
}

/// A device node that exchanges HID reports.
///
/// Feature report buffers start with the report ID byte.
pub trait ReportNode: Send + Sync {
    fn read_report(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_report(&self, data: &[u8]) -> io::Result<usize>;
    fn set_feature(&self, data: &mut [u8]) -> io::Result<usize>;
    fn get_feature(&self, data: &mut [u8]) -> io::Result<usize>;
}

/// Whether an I/O error means "try again" rather than "device gone"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Non-blocking `/dev/hidrawN` (or `/dev/hidgN`) handle
#[derive(Debug)]
pub struct HidrawNode {
    file: File,
    path: PathBuf,
}

impl HidrawNode {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    PassthruError::DeviceNotFound(path.display().to_string())
                } else {
                    PassthruError::Io(e)
                }
            })?;
        debug!("Opened {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl(&self, request: libc::c_ulong, data: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the kernel reads/writes at most `data.len()` bytes, the
        // length encoded in `request`.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request, data.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl AsRawFd for HidrawNode {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl ReportNode for HidrawNode {
    fn read_report(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write_report(&self, data: &[u8]) -> io::Result<usize> {
        (&self.file).write(data)
    }

    fn set_feature(&self, data: &mut [u8]) -> io::Result<usize> {
        self.ioctl(hidiocsfeature(data.len()), data)
    }

    fn get_feature(&self, data: &mut [u8]) -> io::Result<usize> {
        self.ioctl(hidiocgfeature(data.len()), data)
    }
}
