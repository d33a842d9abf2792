//! HID-over-GATT device model
//!
//! Services, published below the application's base path:
//! - `<base>/dis`: Device Information, PnP ID
//! - `<base>/bas`: Battery, battery level
//! - `<base>/ifaceNNNN`: one HID service per relayed USB interface

pub mod handlers;

use std::sync::Arc;

use parking_lot::Mutex;
use passthru_gatt::{
    dbus, uuid16, AttributeFlags, AttributeTree, CharacteristicId, GattError, ServiceId,
    SharedTree,
};
use tracing::{debug, info, warn};

use crate::discovery::INTERFACES_MAX;
use crate::hidraw::{ReportNode, FEATURE_REPORT_SIZE, REPORT_SIZE_MAX};
use handlers::{ControlPoint, FeatureReport, OutputReport};

// Services
pub const UUID_DEV_INFO: u16 = 0x180a;
pub const UUID_BATTERY: u16 = 0x180f;
pub const UUID_HID: u16 = 0x1812;

// Descriptors
pub const UUID_REPORT_REFERENCE: u16 = 0x2908;

// Characteristics
pub const UUID_BATTERY_LEVEL: u16 = 0x2a19;
pub const UUID_HID_INFO: u16 = 0x2a4a;
pub const UUID_REPORT_MAP: u16 = 0x2a4b;
pub const UUID_HID_CONTROL: u16 = 0x2a4c;
pub const UUID_REPORT: u16 = 0x2a4d;
pub const UUID_PNP_ID: u16 = 0x2a50;

/// GAP appearance of a gamepad
pub const GAP_GAMEPAD: u16 = 0x03C4;

pub const REPORT_TYPE_INPUT: u8 = 1;
pub const REPORT_TYPE_OUTPUT: u8 = 2;
pub const REPORT_TYPE_FEATURE: u8 = 3;

/// bcdHID advertised in HID Information
const BCD_HID: u16 = 0x0111;
/// Vendor ID source: USB Implementer's Forum
const PNP_SOURCE_USB: u8 = 2;

/// PnP ID characteristic value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnpId {
    pub vid: u16,
    pub pid: u16,
    pub version: u16,
}

impl PnpId {
    pub fn to_bytes(self) -> [u8; 7] {
        let [v0, v1] = self.vid.to_le_bytes();
        let [p0, p1] = self.pid.to_le_bytes();
        let [r0, r1] = self.version.to_le_bytes();
        [PNP_SOURCE_USB, v0, v1, p0, p1, r0, r1]
    }
}

fn hid_information() -> [u8; 4] {
    let [b0, b1] = BCD_HID.to_le_bytes();
    // bCountryCode 0, flags 0
    [b0, b1, 0, 0]
}

/// What a HID service is built from
pub struct InterfaceSource<'a> {
    /// USB interface number
    pub usb_index: usize,
    pub report_map: &'a [u8],
    pub node: Arc<dyn ReportNode>,
}

/// Handles into the tree for one HID service
#[derive(Debug, Clone)]
pub struct HogpInterface {
    pub usb_index: usize,
    pub service: ServiceId,
    pub report_map: CharacteristicId,
    pub input_report: CharacteristicId,
    pub output_report: CharacteristicId,
    pub feature_report: CharacteristicId,
}

/// A HOGP peripheral: device information, battery and HID services
pub struct HogpDevice {
    tree: SharedTree,
    base_path: String,
    devinfo: ServiceId,
    battery: ServiceId,
    battery_level: CharacteristicId,
    interfaces: Vec<HogpInterface>,
}

impl HogpDevice {
    pub fn new(base_path: &str, pnp: PnpId, sources: &[InterfaceSource<'_>]) -> Result<Self, GattError> {
        if sources.len() > INTERFACES_MAX {
            return Err(GattError::CapacityExceeded {
                kind: "interfaces",
                capacity: INTERFACES_MAX,
            });
        }
        debug!(
            "Creating HID-over-GATT device with {} interfaces",
            sources.len()
        );

        let mut tree = AttributeTree::new();

        let devinfo = tree.add_service(&uuid16(UUID_DEV_INFO), &format!("{base_path}/dis"))?;
        let pnp_id = tree.add_characteristic(devinfo, &uuid16(UUID_PNP_ID), AttributeFlags::READ)?;
        tree.set_value(pnp_id, &pnp.to_bytes());

        let battery = tree.add_service(&uuid16(UUID_BATTERY), &format!("{base_path}/bas"))?;
        let battery_level =
            tree.add_characteristic(battery, &uuid16(UUID_BATTERY_LEVEL), AttributeFlags::READ)?;
        tree.set_value(battery_level, &[100]);

        let mut interfaces = Vec::with_capacity(sources.len());
        for (n, source) in sources.iter().enumerate() {
            let path = format!("{base_path}/iface{n:04x}");
            interfaces.push(build_interface(&mut tree, &path, source)?);
        }

        Ok(Self {
            tree: Arc::new(Mutex::new(tree)),
            base_path: base_path.to_string(),
            devinfo,
            battery,
            battery_level,
            interfaces,
        })
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn interfaces(&self) -> &[HogpInterface] {
        &self.interfaces
    }

    pub fn battery_level(&self) -> u8 {
        self.tree
            .lock()
            .characteristic(self.battery_level)
            .value()
            .as_slice()
            .first()
            .copied()
            .unwrap_or(100)
    }

    /// Store a battery percentage, clamped to 0-100
    pub fn set_battery_level(&self, percentage: f64) {
        let level = if percentage.is_nan() {
            100
        } else {
            percentage.clamp(0.0, 100.0).round() as u8
        };
        debug!("Battery level {level}%");
        self.tree.lock().set_value(self.battery_level, &[level]);
    }

    fn services(&self) -> impl Iterator<Item = ServiceId> + '_ {
        [self.devinfo, self.battery]
            .into_iter()
            .chain(self.interfaces.iter().map(|i| i.service))
    }

    /// Export every service on the bus. Stops at the first failure.
    pub async fn publish(&self, conn: &zbus::Connection) -> Result<(), GattError> {
        dbus::publish_tree(conn, &self.tree).await?;
        info!("Published HOGP services below {}", self.base_path);
        Ok(())
    }

    /// Close notification channels and remove every exported object
    pub async fn teardown(&self, conn: &zbus::Connection) {
        self.tree.lock().release_notify_channels();
        for service in self.services().collect::<Vec<_>>() {
            if let Err(e) = dbus::unpublish_service(conn, &self.tree, service).await {
                warn!("Failed to unpublish service: {e}");
            }
        }
    }
}

fn build_interface(
    tree: &mut AttributeTree,
    path: &str,
    source: &InterfaceSource<'_>,
) -> Result<HogpInterface, GattError> {
    let service = tree.add_service(&uuid16(UUID_HID), path)?;

    let hid_info = tree.add_characteristic(service, &uuid16(UUID_HID_INFO), AttributeFlags::READ)?;
    tree.set_value(hid_info, &hid_information());

    let report_map = tree.add_characteristic(service, &uuid16(UUID_REPORT_MAP), AttributeFlags::READ)?;
    tree.set_value(report_map, source.report_map);

    let control = tree.add_characteristic(
        service,
        &uuid16(UUID_HID_CONTROL),
        AttributeFlags::WRITE_WITHOUT_RESPONSE,
    )?;
    tree.set_write_handler(control, Box::new(ControlPoint));

    let input_report = tree.add_characteristic(
        service,
        &uuid16(UUID_REPORT),
        AttributeFlags::READ | AttributeFlags::NOTIFY,
    )?;

    let output_report = tree.add_characteristic(
        service,
        &uuid16(UUID_REPORT),
        AttributeFlags::READ_WRITE | AttributeFlags::WRITE_WITHOUT_RESPONSE,
    )?;
    tree.characteristic_mut(output_report)
        .value_mut()
        .resize(REPORT_SIZE_MAX);
    tree.set_write_handler(output_report, Box::new(OutputReport::new(Arc::clone(&source.node))));

    let feature_report =
        tree.add_characteristic(service, &uuid16(UUID_REPORT), AttributeFlags::READ_WRITE)?;
    tree.characteristic_mut(feature_report)
        .value_mut()
        .resize(FEATURE_REPORT_SIZE);
    tree.set_write_handler(
        feature_report,
        Box::new(FeatureReport::new(Arc::clone(&source.node), 0)),
    );

    for (chr, report_type) in [
        (input_report, REPORT_TYPE_INPUT),
        (output_report, REPORT_TYPE_OUTPUT),
        (feature_report, REPORT_TYPE_FEATURE),
    ] {
        let reference =
            tree.add_descriptor(chr, &uuid16(UUID_REPORT_REFERENCE), AttributeFlags::READ)?;
        // Report ID 0: single-report device
        tree.set_descriptor_value(reference, &[0, report_type]);
    }

    Ok(HogpInterface {
        usb_index: source.usb_index,
        service,
        report_map,
        input_report,
        output_report,
        feature_report,
    })
}
