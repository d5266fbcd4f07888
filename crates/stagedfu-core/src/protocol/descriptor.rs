//! DFU functional descriptor (DFU 1.1 section 4.1.3).

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{DFU_FUNCTIONAL_DESC_LEN, DFU_FUNCTIONAL_DESC_TYPE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl FunctionalDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    /// Parse a raw descriptor, returning `None` if it is not a DFU functional descriptor.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < DFU_FUNCTIONAL_DESC_LEN
            || raw[0] as usize != DFU_FUNCTIONAL_DESC_LEN
            || raw[1] != DFU_FUNCTIONAL_DESC_TYPE
        {
            return None;
        }
        Some(Self {
            attributes: raw[2],
            detach_timeout: LittleEndian::read_u16(&raw[3..5]),
            transfer_size: LittleEndian::read_u16(&raw[5..7]),
            dfu_version: LittleEndian::read_u16(&raw[7..9]),
        })
    }

    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    #[doc(alias = "wDetachTimeOut")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum bytes per DNLOAD transaction (`wTransferSize`); zero if unknown.
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_functional_descriptor() {
        let raw = [0x09, 0x21, 0x0D, 0xE8, 0x03, 0x00, 0x10, 0x10, 0x01];
        let desc = FunctionalDescriptor::parse(&raw).unwrap();
        assert!(desc.can_download());
        assert!(desc.manifestation_tolerant());
        assert!(desc.will_detach());
        assert_eq!(desc.detach_timeout(), 1000);
        assert_eq!(desc.transfer_size(), 4096);
        assert_eq!(desc.dfu_version(), 0x0110);
    }

    #[test]
    fn test_reject_other_descriptor() {
        let raw = [0x09, 0x04, 0x00, 0x00, 0x00, 0xFE, 0x01, 0x02, 0x00];
        assert!(FunctionalDescriptor::parse(&raw).is_none());
        assert!(FunctionalDescriptor::parse(&[0x09, 0x21]).is_none());
    }
}
