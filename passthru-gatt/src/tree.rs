//! Arena-backed tree of services, characteristics and descriptors
//!
//! Nodes refer to their parents by index into the arena, never by pointer.
//! Object paths are derived on demand from creation order:
//!
//! - service:        `<base>`
//! - characteristic: `<base>/charNNNN`
//! - descriptor:     `<base>/charNNNN/descMMMM`
//!
//! where `NNNN`/`MMMM` are zero-padded 4-digit hex indices within the parent.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixDatagram;

use tracing::{debug, trace};
use zbus::zvariant::ObjectPath;

use crate::buffer::AttributeBuffer;
use crate::error::GattError;
use crate::flags::AttributeFlags;
use crate::handler::{StoreValue, WriteHandler, WriteRequest};
use crate::options::{AttributeOptions, WriteType, DEFAULT_MTU};

/// Characteristics per service
pub const MAX_CHARACTERISTICS: usize = 8;
/// Descriptors per characteristic
pub const MAX_DESCRIPTORS: usize = 4;

/// Index of a service in its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(usize);

/// Index of a characteristic in its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId(usize);

/// Index of a descriptor in its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(usize);

/// Any node of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeRef {
    Service(ServiceId),
    Characteristic(CharacteristicId),
    Descriptor(DescriptorId),
}

/// Result of pushing a value into a notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    /// No peer has acquired the channel yet
    NotAcquired,
    /// The channel is full, try again later
    WouldBlock,
}

#[derive(Debug)]
pub struct GattService {
    uuid: String,
    primary: bool,
    path: String,
    characteristics: Vec<CharacteristicId>,
}

impl GattService {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn primary(&self) -> bool {
        self.primary
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn characteristics(&self) -> &[CharacteristicId] {
        &self.characteristics
    }
}

/// Notification channel of one characteristic
#[derive(Debug, Default)]
struct NotifyChannel {
    socket: Option<UnixDatagram>,
    acquired: bool,
}

pub struct GattCharacteristic {
    uuid: String,
    service: ServiceId,
    flags: AttributeFlags,
    mtu: u16,
    value: AttributeBuffer,
    descriptors: Vec<DescriptorId>,
    write_handler: Option<Box<dyn WriteHandler>>,
    notify: NotifyChannel,
}

impl std::fmt::Debug for GattCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattCharacteristic")
            .field("uuid", &self.uuid)
            .field("service", &self.service)
            .field("flags", &self.flags)
            .field("mtu", &self.mtu)
            .field("value_len", &self.value.len())
            .field("descriptors", &self.descriptors)
            .field("has_write_handler", &self.write_handler.is_some())
            .field("notify_acquired", &self.notify.acquired)
            .finish()
    }
}

impl GattCharacteristic {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn flags(&self) -> AttributeFlags {
        self.flags
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn value(&self) -> &AttributeBuffer {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut AttributeBuffer {
        &mut self.value
    }

    pub fn descriptors(&self) -> &[DescriptorId] {
        &self.descriptors
    }

    pub fn notify_acquired(&self) -> bool {
        self.notify.acquired
    }

    /// Whether a live notification socket is held
    pub fn has_notify_channel(&self) -> bool {
        self.notify.socket.is_some()
    }
}

#[derive(Debug)]
pub struct GattDescriptor {
    uuid: String,
    characteristic: CharacteristicId,
    flags: AttributeFlags,
    value: AttributeBuffer,
}

impl GattDescriptor {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn characteristic(&self) -> CharacteristicId {
        self.characteristic
    }

    pub fn flags(&self) -> AttributeFlags {
        self.flags
    }

    pub fn value(&self) -> &AttributeBuffer {
        &self.value
    }
}

/// Owner of every attribute node of an application
#[derive(Debug, Default)]
pub struct AttributeTree {
    services: Vec<GattService>,
    characteristics: Vec<GattCharacteristic>,
    descriptors: Vec<GattDescriptor>,
}

impl AttributeTree {
    pub fn new() -> Self {
        Self::default()
    }

    // === Construction ===

    /// Add a primary service published at `path`
    pub fn add_service(&mut self, uuid: &str, path: &str) -> Result<ServiceId, GattError> {
        if path == "/" || ObjectPath::try_from(path).is_err() {
            return Err(GattError::InvalidPath(path.to_string()));
        }
        if self.services.iter().any(|s| s.path == path) {
            return Err(GattError::InvalidPath(format!("{path} already in use")));
        }

        let id = ServiceId(self.services.len());
        self.services.push(GattService {
            uuid: uuid.to_string(),
            primary: true,
            path: path.to_string(),
            characteristics: Vec::new(),
        });
        Ok(id)
    }

    /// Append a characteristic to `service`
    pub fn add_characteristic(
        &mut self,
        service: ServiceId,
        uuid: &str,
        flags: AttributeFlags,
    ) -> Result<CharacteristicId, GattError> {
        if self.services[service.0].characteristics.len() == MAX_CHARACTERISTICS {
            return Err(GattError::CapacityExceeded {
                kind: "characteristics",
                capacity: MAX_CHARACTERISTICS,
            });
        }

        let id = CharacteristicId(self.characteristics.len());
        self.characteristics.push(GattCharacteristic {
            uuid: uuid.to_string(),
            service,
            flags,
            mtu: DEFAULT_MTU,
            value: AttributeBuffer::new(),
            descriptors: Vec::new(),
            write_handler: None,
            notify: NotifyChannel::default(),
        });
        self.services[service.0].characteristics.push(id);
        Ok(id)
    }

    /// Append a descriptor to `characteristic`
    pub fn add_descriptor(
        &mut self,
        characteristic: CharacteristicId,
        uuid: &str,
        flags: AttributeFlags,
    ) -> Result<DescriptorId, GattError> {
        if !flags.is_descriptor_subset() {
            return Err(GattError::InvalidDescriptorFlags);
        }
        if self.characteristics[characteristic.0].descriptors.len() == MAX_DESCRIPTORS {
            return Err(GattError::CapacityExceeded {
                kind: "descriptors",
                capacity: MAX_DESCRIPTORS,
            });
        }

        let id = DescriptorId(self.descriptors.len());
        self.descriptors.push(GattDescriptor {
            uuid: uuid.to_string(),
            characteristic,
            flags,
            value: AttributeBuffer::new(),
        });
        self.characteristics[characteristic.0].descriptors.push(id);
        Ok(id)
    }

    pub fn set_write_handler(&mut self, id: CharacteristicId, handler: Box<dyn WriteHandler>) {
        self.characteristics[id.0].write_handler = Some(handler);
    }

    pub fn set_value(&mut self, id: CharacteristicId, bytes: &[u8]) {
        self.characteristics[id.0].value.replace(bytes);
    }

    pub fn set_descriptor_value(&mut self, id: DescriptorId, bytes: &[u8]) {
        self.descriptors[id.0].value.replace(bytes);
    }

    // === Access ===

    pub fn service_ids(&self) -> impl Iterator<Item = ServiceId> + '_ {
        (0..self.services.len()).map(ServiceId)
    }

    pub fn service(&self, id: ServiceId) -> &GattService {
        &self.services[id.0]
    }

    pub fn characteristic(&self, id: CharacteristicId) -> &GattCharacteristic {
        &self.characteristics[id.0]
    }

    pub fn characteristic_mut(&mut self, id: CharacteristicId) -> &mut GattCharacteristic {
        &mut self.characteristics[id.0]
    }

    pub fn descriptor(&self, id: DescriptorId) -> &GattDescriptor {
        &self.descriptors[id.0]
    }

    // === Paths ===

    pub fn service_path(&self, id: ServiceId) -> String {
        self.services[id.0].path.clone()
    }

    pub fn characteristic_path(&self, id: CharacteristicId) -> String {
        let service = &self.services[self.characteristics[id.0].service.0];
        let index = position(&service.characteristics, &id);
        format!("{}/char{:04x}", service.path, index)
    }

    pub fn descriptor_path(&self, id: DescriptorId) -> String {
        let parent = self.descriptors[id.0].characteristic;
        let index = position(&self.characteristics[parent.0].descriptors, &id);
        format!("{}/desc{:04x}", self.characteristic_path(parent), index)
    }

    /// Objects of a service subtree in publication order: the service, then
    /// each characteristic followed by its descriptors.
    pub fn registration_plan(&self, id: ServiceId) -> Vec<(String, AttributeRef)> {
        let service = &self.services[id.0];
        let mut plan = vec![(service.path.clone(), AttributeRef::Service(id))];
        for &chr in &service.characteristics {
            plan.push((self.characteristic_path(chr), AttributeRef::Characteristic(chr)));
            for &desc in &self.characteristics[chr.0].descriptors {
                plan.push((self.descriptor_path(desc), AttributeRef::Descriptor(desc)));
            }
        }
        plan
    }

    // === Protocol methods ===

    /// ReadValue on a characteristic
    pub fn read_characteristic(
        &self,
        id: CharacteristicId,
        opts: &AttributeOptions,
    ) -> Result<Vec<u8>, GattError> {
        let chr = &self.characteristics[id.0];
        if !chr.flags.contains(AttributeFlags::READ) {
            return Err(GattError::NotSupported { operation: "ReadValue" });
        }
        let bytes = chr.value.window(opts.offset, usize::from(opts.mtu))?;
        trace!("Read {} bytes at offset {} from {}", bytes.len(), opts.offset, chr.uuid);
        Ok(bytes.to_vec())
    }

    /// ReadValue on a descriptor
    pub fn read_descriptor(
        &self,
        id: DescriptorId,
        opts: &AttributeOptions,
    ) -> Result<Vec<u8>, GattError> {
        let desc = &self.descriptors[id.0];
        if !desc.flags.contains(AttributeFlags::READ) {
            return Err(GattError::NotSupported { operation: "ReadValue" });
        }
        Ok(desc.value.window(opts.offset, usize::from(opts.mtu))?.to_vec())
    }

    /// WriteValue on a characteristic.
    ///
    /// Commands need `WRITE_WITHOUT_RESPONSE`, requests need `WRITE`. The
    /// handler is not invoked when the capability check fails.
    pub fn write_characteristic(
        &mut self,
        id: CharacteristicId,
        data: &[u8],
        opts: &AttributeOptions,
    ) -> Result<(), GattError> {
        let chr = &mut self.characteristics[id.0];
        let required = match opts.write_type {
            WriteType::Command => AttributeFlags::WRITE_WITHOUT_RESPONSE,
            WriteType::Request => AttributeFlags::WRITE,
        };
        if !chr.flags.intersects(AttributeFlags::WRITE | AttributeFlags::WRITE_WITHOUT_RESPONSE) {
            return Err(GattError::NotSupported { operation: "WriteValue" });
        }
        if !chr.flags.contains(required) {
            return Err(GattError::NotSupported {
                operation: match opts.write_type {
                    WriteType::Command => "WriteValue without response",
                    WriteType::Request => "WriteValue with response",
                },
            });
        }

        let request = WriteRequest {
            data,
            offset: opts.offset,
            mtu: opts.mtu,
        };
        debug!(
            "Write of {} bytes at offset {} to {} ({:?})",
            data.len(),
            opts.offset,
            chr.uuid,
            opts.write_type
        );
        match chr.write_handler.as_mut() {
            Some(handler) => handler.handle_write(&mut chr.value, &request),
            None => StoreValue.handle_write(&mut chr.value, &request),
        }
    }

    /// AcquireNotify on a characteristic.
    ///
    /// Returns the peer end of a fresh datagram socket pair together with
    /// the negotiated MTU. A characteristic can be acquired once.
    pub fn acquire_notify(
        &mut self,
        id: CharacteristicId,
        opts: &AttributeOptions,
    ) -> Result<(OwnedFd, u16), GattError> {
        let chr = &mut self.characteristics[id.0];
        if !chr.flags.contains(AttributeFlags::READ) {
            return Err(GattError::NotSupported { operation: "AcquireNotify" });
        }
        if chr.notify.acquired {
            return Err(GattError::Failed(format!(
                "Notify already acquired on {}",
                chr.uuid
            )));
        }

        let (local, peer) = UnixDatagram::pair()?;
        local.set_nonblocking(true)?;
        chr.notify.socket = Some(local);
        chr.notify.acquired = true;
        chr.mtu = opts.mtu;
        debug!("Notify acquired on {} (mtu {})", chr.uuid, opts.mtu);

        Ok((OwnedFd::from(peer), opts.mtu))
    }

    /// Push `data` to the acquired notification channel and record it as the
    /// characteristic's current value
    pub fn notify(&mut self, id: CharacteristicId, data: &[u8]) -> Result<NotifyOutcome, GattError> {
        let chr = &mut self.characteristics[id.0];
        let Some(socket) = chr.notify.socket.as_ref() else {
            return Ok(NotifyOutcome::NotAcquired);
        };

        match socket.send(data) {
            Ok(_) => {
                chr.value.replace(data);
                Ok(NotifyOutcome::Sent)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(NotifyOutcome::WouldBlock)
            }
            Err(e) => Err(GattError::Io(e)),
        }
    }

    /// Close every notification socket. The acquired latch stays set.
    pub fn release_notify_channels(&mut self) {
        for chr in &mut self.characteristics {
            if chr.notify.socket.take().is_some() {
                debug!("Closed notify channel of {}", chr.uuid);
            }
        }
    }
}

fn position<T: PartialEq>(items: &[T], item: &T) -> usize {
    items.iter().position(|i| i == item).unwrap_or(items.len())
}
