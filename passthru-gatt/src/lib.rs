//! GATT attribute server for BlueZ
//!
//! Applications build an [`AttributeTree`] of services, characteristics and
//! descriptors, attach [`WriteHandler`]s where writes have side effects,
//! then export the tree with [`dbus::publish_tree`]. The protocol logic
//! (ReadValue, WriteValue, AcquireNotify) lives on the tree itself so it can
//! be exercised without a bus.

pub mod buffer;
pub mod dbus;
pub mod error;
pub mod flags;
pub mod handler;
pub mod options;
pub mod tree;

pub use buffer::AttributeBuffer;
pub use dbus::{BluezError, SharedTree};
pub use error::GattError;
pub use flags::AttributeFlags;
pub use handler::{StoreValue, WriteHandler, WriteRequest};
pub use options::{AttributeOptions, WriteType, DEFAULT_MTU};
pub use tree::{
    AttributeRef, AttributeTree, CharacteristicId, DescriptorId, NotifyOutcome, ServiceId,
    MAX_CHARACTERISTICS, MAX_DESCRIPTORS,
};

/// Expand a 16-bit assigned number into a full Bluetooth base UUID
pub fn uuid16(short: u16) -> String {
    format!("0000{short:04x}-0000-1000-8000-00805f9b34fb")
}
