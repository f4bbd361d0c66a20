//! Operator-visible text formatting.
//!
//! Deterministic, pure formatters shared by the status line, the interface
//! chooser and the log output. Kept free of any device state so every
//! caller renders identifiers identically.

use crate::device::{DeviceIdentity, InterfaceSetting};

/// 16-bit value as 4-digit zero-padded lowercase hex, no prefix.
pub fn hex4(n: u16) -> String {
    format!("{:04x}", n)
}

/// 32-bit value as "0x" plus 8-digit zero-padded lowercase hex.
pub fn hex_addr8(n: u32) -> String {
    format!("0x{:08x}", n)
}

/// Human-readable byte size using the largest applicable power-of-1024
/// unit. The quotient is printed exactly, not rounded (1536 is "1.5KiB",
/// 1537 keeps its full fractional expansion).
pub fn nice_size(n: u64) -> String {
    const GIGABYTE: u64 = 1024 * 1024 * 1024;
    const MEGABYTE: u64 = 1024 * 1024;
    const KILOBYTE: u64 = 1024;

    if n >= GIGABYTE {
        format!("{}GiB", n as f64 / GIGABYTE as f64)
    } else if n >= MEGABYTE {
        format!("{}MiB", n as f64 / MEGABYTE as f64)
    } else if n >= KILOBYTE {
        format!("{}KiB", n as f64 / KILOBYTE as f64)
    } else {
        format!("{}B", n)
    }
}

/// Label for one interface alternate, as shown in the chooser.
pub fn interface_alternate_label(setting: &InterfaceSetting) -> String {
    format!(
        "{}: cfg={}, intf={}, alt={}, name=\"{}\"",
        setting.mode(),
        setting.configuration,
        setting.interface,
        setting.alt_setting,
        setting.name.as_deref().unwrap_or("UNKNOWN"),
    )
}

/// dfu-util style one-line summary of a connected interface.
pub fn device_summary(identity: &DeviceIdentity, setting: &InterfaceSetting) -> String {
    format!(
        "{}: [{}:{}] cfg={}, intf={}, alt={}, name=\"{}\" serial=\"{}\"",
        setting.mode(),
        hex4(identity.vendor_id),
        hex4(identity.product_id),
        setting.configuration,
        setting.interface,
        setting.alt_setting,
        identity.product.as_deref().unwrap_or(""),
        identity.serial.as_deref().unwrap_or(""),
    )
}
