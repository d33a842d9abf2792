//! Attribute server error types

use thiserror::Error;

/// Errors raised by the attribute tree and its method handlers
#[derive(Error, Debug)]
pub enum GattError {
    // Protocol validation (returned to the peer)
    #[error("{operation} not supported by attribute")]
    NotSupported { operation: &'static str },

    #[error("Requested offset {offset} exceeds attribute size {length}")]
    InvalidOffset { offset: usize, length: usize },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    // Tree construction
    #[error("Too many {kind}: capacity is {capacity}")]
    CapacityExceeded { kind: &'static str, capacity: usize },

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Descriptor flags must be a subset of read/write")]
    InvalidDescriptorFlags,

    // Transport
    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GattError {
    /// Whether this error belongs to the recoverable protocol-validation class
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            GattError::NotSupported { .. }
                | GattError::InvalidOffset { .. }
                | GattError::InvalidArguments(_)
                | GattError::Failed(_)
        )
    }
}
