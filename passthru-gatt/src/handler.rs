//! Write handler capability attached to characteristics

use crate::buffer::AttributeBuffer;
use crate::error::GattError;

/// One WriteValue call as seen by a handler
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub data: &'a [u8],
    pub offset: usize,
    pub mtu: u16,
}

impl WriteRequest<'_> {
    /// A write shorter than the MTU ends a (possibly multi-part) value
    pub fn is_final(&self) -> bool {
        self.data.len() < usize::from(self.mtu)
    }
}

/// Behaviour invoked when a peer writes a characteristic.
///
/// Implementations own whatever context they need (a device node, a
/// staging buffer) and are responsible for bounds checking `request`
/// against `value`.
pub trait WriteHandler: Send {
    fn handle_write(
        &mut self,
        value: &mut AttributeBuffer,
        request: &WriteRequest<'_>,
    ) -> Result<(), GattError>;
}

/// Stores writes into the attribute value without side effects
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreValue;

impl WriteHandler for StoreValue {
    fn handle_write(
        &mut self,
        value: &mut AttributeBuffer,
        request: &WriteRequest<'_>,
    ) -> Result<(), GattError> {
        value.write_at(request.offset, request.data)
    }
}
