//! Owned attribute value storage

use crate::error::GattError;

/// Resizable byte buffer owned by exactly one attribute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeBuffer {
    data: Vec<u8>,
}

impl AttributeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Grow or shrink, zero-filling new bytes
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Replace the whole value
    pub fn replace(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    /// Slice starting at `offset`, at most `max_len` bytes long.
    ///
    /// `offset == len` is valid and yields an empty slice.
    pub fn window(&self, offset: usize, max_len: usize) -> Result<&[u8], GattError> {
        let length = self.data.len();
        if offset > length {
            return Err(GattError::InvalidOffset { offset, length });
        }
        let end = offset + (length - offset).min(max_len);
        Ok(&self.data[offset..end])
    }

    /// Copy `bytes` in at `offset`, extending the buffer when the write runs
    /// past the current end. `offset` itself may not skip past the end.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), GattError> {
        let length = self.data.len();
        if offset > length {
            return Err(GattError::InvalidOffset { offset, length });
        }
        let end = offset + bytes.len();
        if end > length {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_clamps_to_max_len() {
        let buf = AttributeBuffer::from_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(buf.window(1, 2).unwrap(), &[2, 3]);
        assert_eq!(buf.window(3, 100).unwrap(), &[4, 5]);
    }

    #[test]
    fn window_at_end_is_empty() {
        let buf = AttributeBuffer::from_bytes(&[1, 2, 3]);
        assert!(buf.window(3, 10).unwrap().is_empty());
    }

    #[test]
    fn window_past_end_reports_offset_and_length() {
        let buf = AttributeBuffer::from_bytes(&[1, 2, 3]);
        match buf.window(4, 10) {
            Err(GattError::InvalidOffset { offset, length }) => {
                assert_eq!(offset, 4);
                assert_eq!(length, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn write_at_extends() {
        let mut buf = AttributeBuffer::from_bytes(&[1, 2]);
        buf.write_at(1, &[9, 9, 9]).unwrap();
        assert_eq!(buf.as_slice(), &[1, 9, 9, 9]);
    }

    #[test]
    fn write_at_rejects_gap() {
        let mut buf = AttributeBuffer::zeroed(2);
        assert!(buf.write_at(3, &[1]).is_err());
        assert_eq!(buf.as_slice(), &[0, 0]);
    }
}
