//! Device and interface identification.
//!
//! A `DeviceIdentity` is read once when a device is first seen and never
//! mutated; disconnect notifications are matched against it. An
//! `InterfaceSetting` names one connectable DFU alternate on a device.

use std::fmt;

/// USB interface protocol values defined by the DFU class.
pub const PROTOCOL_RUNTIME: u8 = 0x01;
pub const PROTOCOL_DFU: u8 = 0x02;

/// Immutable identity of a physical device, captured at discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial: None,
            manufacturer: None,
            product: None,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }
}

/// Operating mode of a DFU interface alternate, derived from the
/// interface protocol byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceMode {
    /// Application firmware is running; the device must detach before
    /// it will accept a download.
    Runtime,
    /// Dedicated update mode; downloads go directly to this interface.
    Dfu,
    /// Any other protocol value.
    Unknown,
}

impl InterfaceMode {
    pub fn from_protocol(protocol: u8) -> Self {
        match protocol {
            PROTOCOL_RUNTIME => InterfaceMode::Runtime,
            PROTOCOL_DFU => InterfaceMode::Dfu,
            _ => InterfaceMode::Unknown,
        }
    }

    pub fn protocol(&self) -> Option<u8> {
        match self {
            InterfaceMode::Runtime => Some(PROTOCOL_RUNTIME),
            InterfaceMode::Dfu => Some(PROTOCOL_DFU),
            InterfaceMode::Unknown => None,
        }
    }
}

impl fmt::Display for InterfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceMode::Runtime => write!(f, "Runtime"),
            InterfaceMode::Dfu => write!(f, "DFU"),
            InterfaceMode::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One connectable DFU interface alternate.
///
/// The name may be absent when the configuration listing did not carry a
/// string descriptor; [`crate::discovery::fix_interface_names`] can patch
/// it with a secondary fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSetting {
    /// `bConfigurationValue` of the enclosing configuration.
    pub configuration: u8,
    /// `bInterfaceNumber`.
    pub interface: u8,
    /// `bAlternateSetting`.
    pub alt_setting: u8,
    /// Raw `bInterfaceProtocol` byte.
    pub protocol: u8,
    pub name: Option<String>,
}

impl InterfaceSetting {
    pub fn mode(&self) -> InterfaceMode {
        InterfaceMode::from_protocol(self.protocol)
    }
}

/// A discovered (device, interface alternate) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuTarget {
    pub identity: DeviceIdentity,
    pub setting: InterfaceSetting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_protocol() {
        assert_eq!(InterfaceMode::from_protocol(1), InterfaceMode::Runtime);
        assert_eq!(InterfaceMode::from_protocol(2), InterfaceMode::Dfu);
        assert_eq!(InterfaceMode::from_protocol(0), InterfaceMode::Unknown);
        assert_eq!(InterfaceMode::from_protocol(0xFF), InterfaceMode::Unknown);
    }

    #[test]
    fn test_mode_protocol_roundtrip() {
        assert_eq!(InterfaceMode::Runtime.protocol(), Some(1));
        assert_eq!(InterfaceMode::Dfu.protocol(), Some(2));
        assert_eq!(InterfaceMode::Unknown.protocol(), None);
    }

    #[test]
    fn test_identity_comparison() {
        let a = DeviceIdentity::new(0x0483, 0xDF11).with_serial("357A38663036");
        let b = DeviceIdentity::new(0x0483, 0xDF11).with_serial("357A38663036");
        let c = DeviceIdentity::new(0x0483, 0xDF11);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
