//! HOGP device driven end to end: attribute writes reach the device node and
//! relayed input reports arrive on the notification socket.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use passthru_gatt::{AttributeOptions, GattError, NotifyOutcome, WriteType};

use hid_passthru::filter::{filter_for, PID_STEAM_DECK, VID_VALVE};
use hid_passthru::hogp::{HogpDevice, InterfaceSource, PnpId};
use hid_passthru::relay::{FlushReason, Relay, RelayTiming};
use hid_passthru::ReportNode;

#[derive(Default)]
struct RecordingNode {
    written: Mutex<Vec<Vec<u8>>>,
    set_features: Mutex<Vec<Vec<u8>>>,
    feature_reply: Mutex<Vec<u8>>,
}

impl ReportNode for RecordingNode {
    fn read_report(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn write_report(&self, data: &[u8]) -> io::Result<usize> {
        self.written.lock().push(data.to_vec());
        Ok(data.len())
    }

    fn set_feature(&self, data: &mut [u8]) -> io::Result<usize> {
        self.set_features.lock().push(data.to_vec());
        Ok(data.len())
    }

    fn get_feature(&self, data: &mut [u8]) -> io::Result<usize> {
        let reply = self.feature_reply.lock();
        let n = reply.len().min(data.len());
        data[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }
}

const REPORT_MAP: &[u8] = &[0x06, 0xFF, 0xFF, 0x09, 0x01, 0xA1, 0x01, 0xC0];

fn deck(nodes: &[Arc<RecordingNode>]) -> HogpDevice {
    let sources: Vec<InterfaceSource<'_>> = nodes
        .iter()
        .enumerate()
        .map(|(n, node)| InterfaceSource {
            usb_index: n * 2,
            report_map: REPORT_MAP,
            node: node.clone(),
        })
        .collect();
    HogpDevice::new(
        "/org/hid_passthru",
        PnpId {
            vid: VID_VALVE,
            pid: PID_STEAM_DECK,
            version: 0x0200,
        },
        &sources,
    )
    .unwrap()
}

fn command() -> AttributeOptions {
    AttributeOptions {
        write_type: WriteType::Command,
        ..AttributeOptions::default()
    }
}

#[test]
fn test_output_report_reaches_device() {
    let node = Arc::new(RecordingNode::default());
    let device = deck(&[node.clone()]);
    let output = device.interfaces()[0].output_report;

    device
        .tree()
        .lock()
        .write_characteristic(output, &[0x8F, 0x01, 0x02], &command())
        .unwrap();
    assert_eq!(node.written.lock().as_slice(), &[vec![0x8F, 0x01, 0x02]]);
}

#[test]
fn test_feature_report_round_trip() {
    let node = Arc::new(RecordingNode::default());
    *node.feature_reply.lock() = vec![0, 0xAA, 0xBB, 0xCC];
    let device = deck(&[node.clone()]);
    let feature = device.interfaces()[0].feature_report;

    let mut tree = device.tree().lock();
    tree.write_characteristic(feature, &[0x83, 0x00], &AttributeOptions::default())
        .unwrap();
    assert_eq!(node.set_features.lock().as_slice(), &[vec![0, 0x83, 0x00]]);

    let value = tree
        .read_characteristic(feature, &AttributeOptions::default())
        .unwrap();
    assert_eq!(value.len(), 64);
    assert_eq!(&value[..4], &[0xAA, 0xBB, 0xCC, 0x00]);
}

#[test]
fn test_feature_report_rejects_commands() {
    let node = Arc::new(RecordingNode::default());
    let device = deck(&[node.clone()]);
    let feature = device.interfaces()[0].feature_report;

    let err = device
        .tree()
        .lock()
        .write_characteristic(feature, &[1], &command())
        .unwrap_err();
    assert!(matches!(err, GattError::NotSupported { .. }));
    assert!(node.set_features.lock().is_empty());
}

#[test]
fn test_report_map_read_in_pieces() {
    let device = deck(&[Arc::new(RecordingNode::default())]);
    let map = device.interfaces()[0].report_map;
    let tree = device.tree().lock();

    let first = tree
        .read_characteristic(
            map,
            &AttributeOptions {
                mtu: 5,
                ..AttributeOptions::default()
            },
        )
        .unwrap();
    let rest = tree
        .read_characteristic(
            map,
            &AttributeOptions {
                offset: 5,
                ..AttributeOptions::default()
            },
        )
        .unwrap();
    assert_eq!([first, rest].concat(), REPORT_MAP);
}

#[test]
fn test_input_reports_relayed_as_notifications() {
    let nodes = [
        Arc::new(RecordingNode::default()),
        Arc::new(RecordingNode::default()),
    ];
    let device = deck(&nodes);
    let interfaces = device.interfaces().to_vec();

    // Nothing is sent before the host subscribes
    let raw = interfaces[1].input_report;
    assert_eq!(
        device.tree().lock().notify(raw, &[0; 64]).unwrap(),
        NotifyOutcome::NotAcquired
    );

    let (fd, mtu) = device
        .tree()
        .lock()
        .acquire_notify(raw, &AttributeOptions::default())
        .unwrap();
    assert_eq!(mtu, 517);
    let peer = UnixDatagram::from(fd);
    peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

    let t0 = Instant::now();
    let filters = interfaces
        .iter()
        .map(|i| filter_for(VID_VALVE, PID_STEAM_DECK, i.usb_index))
        .collect();
    let mut relay = Relay::new(RelayTiming::default(), filters, t0);

    let mut pressed = [0u8; 64];
    pressed[8] = 0x01;
    let now = t0 + Duration::from_millis(30);
    assert_eq!(relay.on_report(1, &pressed, now), Some(FlushReason::Filter));

    let outcome = device
        .tree()
        .lock()
        .notify(raw, relay.pending(1))
        .unwrap();
    assert_eq!(outcome, NotifyOutcome::Sent);
    relay.mark_flushed(1, now);

    let mut buf = [0u8; 128];
    let n = peer.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &pressed);

    // The sent report becomes the characteristic value
    let value = device
        .tree()
        .lock()
        .read_characteristic(raw, &AttributeOptions::default())
        .unwrap();
    assert_eq!(value, pressed);
}

#[test]
fn test_battery_level() {
    let device = deck(&[Arc::new(RecordingNode::default())]);
    assert_eq!(device.battery_level(), 100);
    device.set_battery_level(41.6);
    assert_eq!(device.battery_level(), 42);
    device.set_battery_level(-3.0);
    assert_eq!(device.battery_level(), 0);
}
