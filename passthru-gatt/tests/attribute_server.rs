//! Attribute server behaviour exercised through the public API, without a bus.

use std::os::unix::net::UnixDatagram;
use std::sync::Arc;

use parking_lot::Mutex;
use passthru_gatt::{
    uuid16, AttributeBuffer, AttributeFlags, AttributeOptions, AttributeTree, BluezError,
    GattError, NotifyOutcome, WriteHandler, WriteRequest, WriteType,
};

// ── Helpers ──

/// Collects complete multi-part writes
struct Assembler {
    staged: Vec<u8>,
    completed: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl WriteHandler for Assembler {
    fn handle_write(
        &mut self,
        value: &mut AttributeBuffer,
        request: &WriteRequest<'_>,
    ) -> Result<(), GattError> {
        if request.offset != self.staged.len() {
            return Err(GattError::InvalidOffset {
                offset: request.offset,
                length: self.staged.len(),
            });
        }
        self.staged.extend_from_slice(request.data);
        if request.is_final() {
            value.replace(&self.staged);
            self.completed.lock().push(std::mem::take(&mut self.staged));
        }
        Ok(())
    }
}

fn opts(offset: usize, mtu: u16) -> AttributeOptions {
    AttributeOptions {
        offset,
        mtu,
        write_type: WriteType::Request,
    }
}

// ── Tests ──

#[test]
fn multi_part_write_is_assembled() {
    let completed = Arc::new(Mutex::new(Vec::new()));
    let mut tree = AttributeTree::new();
    let svc = tree.add_service(&uuid16(0x1812), "/test/hid").unwrap();
    let chr = tree
        .add_characteristic(svc, &uuid16(0x2a4d), AttributeFlags::READ_WRITE)
        .unwrap();
    tree.set_write_handler(
        chr,
        Box::new(Assembler {
            staged: Vec::new(),
            completed: Arc::clone(&completed),
        }),
    );

    tree.write_characteristic(chr, &[1, 2, 3, 4], &opts(0, 4)).unwrap();
    assert!(completed.lock().is_empty());
    tree.write_characteristic(chr, &[5], &opts(4, 4)).unwrap();

    assert_eq!(completed.lock().as_slice(), &[vec![1, 2, 3, 4, 5]]);
    assert_eq!(
        tree.read_characteristic(chr, &opts(0, 517)).unwrap(),
        vec![1, 2, 3, 4, 5]
    );
}

#[test]
fn notifications_reach_acquirer_in_order() {
    let mut tree = AttributeTree::new();
    let svc = tree.add_service(&uuid16(0x1812), "/test/hid").unwrap();
    let chr = tree
        .add_characteristic(svc, &uuid16(0x2a4d), AttributeFlags::READ | AttributeFlags::NOTIFY)
        .unwrap();

    let (fd, mtu) = tree.acquire_notify(chr, &opts(0, 23)).unwrap();
    assert_eq!(mtu, 23);
    let peer = UnixDatagram::from(fd);

    for n in 0..3u8 {
        assert_eq!(tree.notify(chr, &[n; 4]).unwrap(), NotifyOutcome::Sent);
    }
    let mut buf = [0u8; 16];
    for n in 0..3u8 {
        let len = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[n; 4]);
    }
}

#[test]
fn full_channel_reports_would_block() {
    let mut tree = AttributeTree::new();
    let svc = tree.add_service(&uuid16(0x1812), "/test/hid").unwrap();
    let chr = tree
        .add_characteristic(svc, &uuid16(0x2a4d), AttributeFlags::READ | AttributeFlags::NOTIFY)
        .unwrap();
    let (_fd, _) = tree.acquire_notify(chr, &opts(0, 517)).unwrap();

    // Peer never reads, so the socket buffer eventually fills
    let report = [0u8; 64];
    let mut outcome = NotifyOutcome::Sent;
    for _ in 0..100_000 {
        outcome = tree.notify(chr, &report).unwrap();
        if outcome != NotifyOutcome::Sent {
            break;
        }
    }
    assert_eq!(outcome, NotifyOutcome::WouldBlock);
}

#[test]
fn protocol_errors_map_to_bluez_names() {
    let err = BluezError::from(GattError::InvalidOffset {
        offset: 9,
        length: 3,
    });
    assert!(matches!(err, BluezError::InvalidOffset(_)));

    let err = BluezError::from(GattError::NotSupported {
        operation: "ReadValue",
    });
    assert!(matches!(err, BluezError::NotSupported(_)));

    let err = BluezError::from(GattError::Failed("busy".into()));
    assert!(matches!(err, BluezError::Failed(ref m) if m == "busy"));
}

#[test]
fn offset_past_end_is_rejected_for_every_reader() {
    let mut tree = AttributeTree::new();
    let svc = tree.add_service(&uuid16(0x180f), "/test/bas").unwrap();
    let chr = tree
        .add_characteristic(svc, &uuid16(0x2a19), AttributeFlags::READ)
        .unwrap();
    tree.set_value(chr, &[100]);

    assert_eq!(tree.read_characteristic(chr, &opts(1, 517)).unwrap(), Vec::<u8>::new());
    assert!(matches!(
        tree.read_characteristic(chr, &opts(2, 517)),
        Err(GattError::InvalidOffset { offset: 2, length: 1 })
    ));
}
