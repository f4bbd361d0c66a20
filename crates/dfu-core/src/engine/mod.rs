//! DFU engine abstraction.
//!
//! Defines the `DfuEngine`/`DfuHandle` traits for the byte-level DFU
//! collaborator, allowing different implementations (nusb, mock, etc.).
//! The session layer drives the connect/probe/download lifecycle through
//! these traits and never touches the wire protocol directly.

mod mock;
mod nusb;

pub use mock::{MockEngine, MockHandle};
pub use nusb::{NusbEngine, NusbHandle};

use std::collections::HashMap;

use thiserror::Error;

use crate::device::{DeviceIdentity, DfuTarget, InterfaceSetting};

// DFU device states, section 6.1.2 of the DFU 1.1 spec.
// pub const DFU_STATE_APP_IDLE: u8 = 0x00;
// pub const DFU_STATE_APP_DETACH: u8 = 0x01;
pub const DFU_STATE_DFU_IDLE: u8 = 0x02;
// pub const DFU_STATE_DNLOAD_SYNC: u8 = 0x03;
pub const DFU_STATE_DNBUSY: u8 = 0x04;
pub const DFU_STATE_DNLOAD_IDLE: u8 = 0x05;
// pub const DFU_STATE_MANIFEST_SYNC: u8 = 0x06;
// pub const DFU_STATE_MANIFEST: u8 = 0x07;
pub const DFU_STATE_MANIFEST_WAIT_RESET: u8 = 0x08;
// pub const DFU_STATE_UPLOAD_IDLE: u8 = 0x09;
/// The error state that forces a `clear_status` before a new download.
pub const DFU_STATE_ERROR: u8 = 0x0A;

pub const DFU_STATUS_OK: u8 = 0x00;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No device found")]
    DeviceNotFound,

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    #[error("Descriptor read failed: {0}")]
    DescriptorReadFailed(String),

    #[error("DFU status error: state={state} status={status}")]
    Status { state: u8, status: u8 },

    /// Expected side effect of a deliberate disconnect mid-transfer.
    #[error("The transfer was cancelled")]
    TransferCancelled,

    /// Operation on a handle whose device is gone.
    #[error("The device must be opened first")]
    NotOpen,

    #[error("Device disconnected")]
    Disconnected,
}

/// GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    /// Minimum time in ms the host must wait before the next GETSTATUS.
    pub poll_timeout_ms: u32,
    pub state: u8,
}

impl DfuStatus {
    pub fn from_raw(data: &[u8]) -> Self {
        Self {
            status: data[0],
            poll_timeout_ms: (data[3] as u32) << 16 | (data[2] as u32) << 8 | (data[1] as u32),
            state: data[4],
        }
    }

    pub fn is_error(&self) -> bool {
        self.state == DFU_STATE_ERROR
    }
}

/// Interface name string descriptors, keyed configuration value →
/// interface number → alternate setting.
pub type InterfaceNameMap = HashMap<u8, HashMap<u8, HashMap<u8, Option<String>>>>;

/// Host-side view of the DFU collaborator.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait DfuEngine {
    type Handle: DfuHandle;

    /// Enumerate every DFU interface alternate on every visible device.
    fn list_interfaces(&self) -> Result<Vec<DfuTarget>, EngineError>;

    /// Enumerate the DFU interface alternates of one physical device.
    fn device_interfaces(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Vec<InterfaceSetting>, EngineError>;

    /// Open the device exclusively and claim the given alternate.
    fn open(
        &self,
        identity: &DeviceIdentity,
        setting: &InterfaceSetting,
    ) -> Result<Self::Handle, EngineError>;
}

/// One exclusively-owned open device.
pub trait DfuHandle {
    fn close(&mut self) -> Result<(), EngineError>;

    /// Issue DFU_DETACH; meaningful only on Runtime-mode interfaces.
    fn detach(&self, timeout_ms: u16) -> Result<(), EngineError>;

    fn get_status(&self) -> Result<DfuStatus, EngineError>;

    fn clear_status(&self) -> Result<(), EngineError>;

    /// Raw configuration descriptor at the given index.
    fn read_configuration_descriptor(&self, index: u8) -> Result<Vec<u8>, EngineError>;

    /// Interface name string descriptors for every configuration.
    fn read_interface_names(&self) -> Result<InterfaceNameMap, EngineError>;

    /// Run one complete firmware download transaction: chunked block
    /// writes, status polling and the manifestation wait. Reports
    /// `(bytes_done, bytes_total)` through `progress` after every block.
    fn do_download(
        &self,
        chunk_size: usize,
        firmware: &[u8],
        manifestation_tolerant: bool,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), EngineError>;

    /// Legacy readback path; not surfaced by the session layer.
    fn do_upload(&self, chunk_size: usize) -> Result<Vec<u8>, EngineError>;
}
