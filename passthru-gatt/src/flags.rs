//! Attribute capability flags

use bitflags::bitflags;

bitflags! {
    /// Capabilities advertised by a characteristic or descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttributeFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const NOTIFY = 0x08;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl AttributeFlags {
    /// BlueZ `Flags` property strings, in a stable order
    pub fn to_bluez(self) -> Vec<String> {
        let mut names = Vec::with_capacity(4);
        if self.contains(Self::READ) {
            names.push("read".to_string());
        }
        if self.contains(Self::WRITE) {
            names.push("write".to_string());
        }
        if self.contains(Self::WRITE_WITHOUT_RESPONSE) {
            names.push("write-without-response".to_string());
        }
        if self.contains(Self::NOTIFY) {
            names.push("notify".to_string());
        }
        names
    }

    /// Flags a descriptor may carry
    pub fn is_descriptor_subset(self) -> bool {
        Self::READ_WRITE.contains(self)
    }
}
