//! Configuration descriptor parsing and DFU capability derivation.
//!
//! The configuration descriptor arrives as raw bytes from the device; this
//! module walks it into a typed `ConfigDescriptor` and extracts the DFU
//! functional descriptor (type 0x21, section 4.1.3 of the DFU spec) when
//! one is present. Note that HID descriptors share the 0x21 type tag, so a
//! sub-descriptor only counts as functional when it is long enough to
//! carry the DFU fields.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::SessionError;

pub(crate) const DFU_FUNCTIONAL_TYPE: u8 = 0x21;
pub(crate) const DFU_FUNCTIONAL_LEN: usize = 9;
const CONFIGURATION_TYPE: u8 = 0x02;

/// Parsed configuration descriptor: the configuration value plus every
/// sub-descriptor found in the combined blob.
#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    pub configuration_value: u8,
    pub descriptors: Vec<SubDescriptor>,
}

#[derive(Debug, Clone)]
pub enum SubDescriptor {
    Functional(FunctionalDescriptor),
    Other { descriptor_type: u8 },
}

/// DFU functional descriptor fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub attributes: u8,
    pub detach_timeout_ms: u16,
    pub transfer_size: u16,
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    fn from_raw(raw: &[u8]) -> Self {
        Self {
            attributes: raw[2],
            detach_timeout_ms: LittleEndian::read_u16(&raw[3..5]),
            transfer_size: LittleEndian::read_u16(&raw[5..7]),
            dfu_version: LittleEndian::read_u16(&raw[7..9]),
        }
    }
}

/// Capability flags derived from a functional descriptor, fixed for the
/// life of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub will_detach: bool,
    pub manifestation_tolerant: bool,
    pub can_download: bool,
    pub detach_timeout_ms: u16,
    pub dfu_version: u16,
}

impl From<&FunctionalDescriptor> for DeviceCapabilities {
    fn from(desc: &FunctionalDescriptor) -> Self {
        Self {
            will_detach: desc.attributes & FunctionalDescriptor::BIT_WILL_DETACH != 0,
            manifestation_tolerant: desc.attributes
                & FunctionalDescriptor::BIT_MANIFESTATION_TOLERANT
                != 0,
            can_download: desc.attributes & FunctionalDescriptor::BIT_CAN_DNLOAD != 0,
            detach_timeout_ms: desc.detach_timeout_ms,
            dfu_version: desc.dfu_version,
        }
    }
}

impl DeviceCapabilities {
    pub fn can_upload(desc: &FunctionalDescriptor) -> bool {
        desc.attributes & FunctionalDescriptor::BIT_CAN_UPLOAD != 0
    }

    /// One-line summary in the original tool's wording.
    pub fn summary(&self) -> String {
        format!(
            "WillDetach={}, ManifestationTolerant={}, CanDnload={}, \
             DetachTimeOut={}, Version={}",
            self.will_detach,
            self.manifestation_tolerant,
            self.can_download,
            self.detach_timeout_ms,
            crate::format::hex4(self.dfu_version),
        )
    }
}

/// Walk a raw configuration descriptor blob into its typed form.
pub fn parse_configuration_descriptor(raw: &[u8]) -> Result<ConfigDescriptor, SessionError> {
    if raw.len() < 9 {
        return Err(SessionError::Probe(format!(
            "configuration descriptor too short: {} bytes",
            raw.len()
        )));
    }
    if raw[1] != CONFIGURATION_TYPE {
        return Err(SessionError::Probe(format!(
            "not a configuration descriptor: type 0x{:02x}",
            raw[1]
        )));
    }

    let total_length = (LittleEndian::read_u16(&raw[2..4]) as usize).min(raw.len());
    let configuration_value = raw[5];

    let mut descriptors = Vec::new();
    let mut offset = raw[0] as usize;
    while offset + 2 <= total_length {
        let length = raw[offset] as usize;
        if length < 2 || offset + length > total_length {
            return Err(SessionError::Probe(format!(
                "malformed sub-descriptor at offset {}",
                offset
            )));
        }
        let descriptor_type = raw[offset + 1];
        if descriptor_type == DFU_FUNCTIONAL_TYPE && length >= DFU_FUNCTIONAL_LEN {
            descriptors.push(SubDescriptor::Functional(FunctionalDescriptor::from_raw(
                &raw[offset..offset + DFU_FUNCTIONAL_LEN],
            )));
        } else {
            descriptors.push(SubDescriptor::Other { descriptor_type });
        }
        offset += length;
    }

    Ok(ConfigDescriptor {
        configuration_value,
        descriptors,
    })
}
