//! nusb-based DFU engine implementation.
//!
//! Key nusb 0.2 API patterns:
//! - `list_devices().wait()` for device enumeration
//! - `device_info.open().wait()` to open a device
//! - `device.claim_interface(n).wait()` to claim an interface
//! - `interface.control_in/control_out(.., timeout).wait()` for the DFU
//!   class requests

use std::num::NonZeroU8;
use std::thread;
use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::{
    DFU_STATE_DFU_IDLE, DFU_STATE_DNLOAD_IDLE, DFU_STATE_MANIFEST_WAIT_RESET, DFU_STATUS_OK,
    DfuEngine, DfuHandle, DfuStatus, EngineError, InterfaceNameMap,
};
use crate::device::{DeviceIdentity, DfuTarget, InterfaceSetting, PROTOCOL_DFU, PROTOCOL_RUNTIME};

const DFU_CLASS: u8 = 0xFE;
const DFU_SUBCLASS: u8 = 0x01;

// DFU class requests, section 3 of the DFU 1.1 spec.
const DFU_CMD_DETACH: u8 = 0;
const DFU_CMD_DNLOAD: u8 = 1;
const DFU_CMD_UPLOAD: u8 = 2;
const DFU_CMD_GETSTATUS: u8 = 3;
const DFU_CMD_CLRSTATUS: u8 = 4;

const GET_DESCRIPTOR: u8 = 6;
const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;

const DFU_STATUS_LEN: u16 = 6;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// nusb-backed DFU engine.
pub struct NusbEngine;

impl NusbEngine {
    pub fn new() -> Self {
        Self
    }

    fn find_device_info(&self, identity: &DeviceIdentity) -> Result<DeviceInfo, EngineError> {
        list_devices()
            .wait()
            .map_err(|e| EngineError::OpenFailed(e.to_string()))?
            .find(|info| matches_identity(info, identity))
            .ok_or(EngineError::DeviceNotFound)
    }
}

impl Default for NusbEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_identity(info: &DeviceInfo, identity: &DeviceIdentity) -> bool {
    info.vendor_id() == identity.vendor_id
        && info.product_id() == identity.product_id
        && match identity.serial.as_deref() {
            Some(serial) => info.serial_number() == Some(serial),
            None => true,
        }
}

fn is_dfu_device(info: &DeviceInfo) -> bool {
    info.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

fn identity_of(info: &DeviceInfo) -> DeviceIdentity {
    DeviceIdentity {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        serial: info.serial_number().map(str::to_string),
        manufacturer: info.manufacturer_string().map(str::to_string),
        product: info.product_string().map(str::to_string),
    }
}

fn get_string_descriptor(device: &Device, index: NonZeroU8) -> Option<String> {
    let language = device
        .get_string_descriptor_supported_languages(CONTROL_TIMEOUT)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(index, language, CONTROL_TIMEOUT)
        .wait()
        .ok()
}

/// DFU interface alternates of one opened device: protocol 1 (Runtime)
/// or 2 (DFU) on the DFU class/subclass.
fn dfu_settings(device: &Device) -> Vec<InterfaceSetting> {
    device
        .configurations()
        .flat_map(|configuration| {
            let config = configuration.configuration_value();
            configuration
                .interface_alt_settings()
                .filter(|alt| {
                    alt.class() == DFU_CLASS
                        && alt.subclass() == DFU_SUBCLASS
                        && matches!(alt.protocol(), PROTOCOL_RUNTIME | PROTOCOL_DFU)
                })
                .map(move |alt| InterfaceSetting {
                    configuration: config,
                    interface: alt.interface_number(),
                    alt_setting: alt.alternate_setting(),
                    protocol: alt.protocol(),
                    name: alt
                        .string_index()
                        .and_then(|idx| get_string_descriptor(device, idx)),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

impl DfuEngine for NusbEngine {
    type Handle = NusbHandle;

    #[instrument(level = "debug", skip(self))]
    fn list_interfaces(&self) -> Result<Vec<DfuTarget>, EngineError> {
        let devices: Vec<DeviceInfo> = list_devices()
            .wait()
            .map_err(|e| EngineError::OpenFailed(e.to_string()))?
            .filter(is_dfu_device)
            .collect();

        let mut targets = Vec::new();
        for info in devices {
            let identity = identity_of(&info);
            let device = match info.open().wait() {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, vid = %format!("{:04x}", identity.vendor_id),
                        "Skipping unopenable device");
                    continue;
                }
            };
            for setting in dfu_settings(&device) {
                targets.push(DfuTarget {
                    identity: identity.clone(),
                    setting,
                });
            }
        }
        debug!(count = targets.len(), "Enumerated DFU interfaces");
        Ok(targets)
    }

    fn device_interfaces(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Vec<InterfaceSetting>, EngineError> {
        let info = self.find_device_info(identity)?;
        let device = info
            .open()
            .wait()
            .map_err(|e| EngineError::OpenFailed(e.to_string()))?;
        Ok(dfu_settings(&device))
    }

    #[instrument(level = "info", skip(self, identity, setting),
        fields(vid = %format!("{:04x}", identity.vendor_id),
               pid = %format!("{:04x}", identity.product_id),
               intf = setting.interface, alt = setting.alt_setting))]
    fn open(
        &self,
        identity: &DeviceIdentity,
        setting: &InterfaceSetting,
    ) -> Result<NusbHandle, EngineError> {
        let info = self.find_device_info(identity)?;
        let device = info
            .open()
            .wait()
            .map_err(|e| EngineError::OpenFailed(e.to_string()))?;

        let interface = device.claim_interface(setting.interface).wait().map_err(|e| {
            EngineError::ClaimInterfaceFailed {
                interface: setting.interface,
                message: e.to_string(),
            }
        })?;
        interface
            .set_alt_setting(setting.alt_setting)
            .wait()
            .map_err(|e| EngineError::ClaimInterfaceFailed {
                interface: setting.interface,
                message: e.to_string(),
            })?;

        info!("Device opened");
        Ok(NusbHandle {
            device,
            interface: Some(interface),
        })
    }
}

/// One exclusively-claimed DFU interface.
pub struct NusbHandle {
    device: Device,
    interface: Option<Interface>,
}

impl NusbHandle {
    fn interface(&self) -> Result<&Interface, EngineError> {
        self.interface.as_ref().ok_or(EngineError::NotOpen)
    }

    fn dfu_cmd_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), EngineError> {
        let interface = self.interface()?;
        let index = interface.interface_number() as u16;
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn dfu_cmd_in(&self, request: u8, value: u16, length: u16) -> Result<Vec<u8>, EngineError> {
        let interface = self.interface()?;
        let index = interface.interface_number() as u16;
        interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    /// Poll GETSTATUS until the device reaches `target` state, honoring
    /// the device-requested poll interval. A non-OK status aborts.
    fn poll_until_state(&self, target: u8) -> Result<DfuStatus, EngineError> {
        loop {
            let st = self.get_status()?;
            if st.status != DFU_STATUS_OK {
                return Err(EngineError::Status {
                    state: st.state,
                    status: st.status,
                });
            }
            if st.state == target {
                return Ok(st);
            }
            thread::sleep(Duration::from_millis(st.poll_timeout_ms as u64));
        }
    }
}

fn map_transfer_error(err: TransferError) -> EngineError {
    match err {
        TransferError::Cancelled => EngineError::TransferCancelled,
        TransferError::Disconnected => EngineError::Disconnected,
        other => EngineError::ControlFailed(other.to_string()),
    }
}

impl DfuHandle for NusbHandle {
    fn close(&mut self) -> Result<(), EngineError> {
        if self.interface.take().is_some() {
            debug!("Released DFU interface");
        }
        Ok(())
    }

    fn detach(&self, timeout_ms: u16) -> Result<(), EngineError> {
        self.dfu_cmd_out(DFU_CMD_DETACH, timeout_ms, &[])
    }

    fn get_status(&self) -> Result<DfuStatus, EngineError> {
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)?;
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(EngineError::ControlFailed(format!(
                "short GETSTATUS response: {} bytes",
                data.len()
            )));
        }
        Ok(DfuStatus::from_raw(&data))
    }

    fn clear_status(&self) -> Result<(), EngineError> {
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[])
    }

    fn read_configuration_descriptor(&self, index: u8) -> Result<Vec<u8>, EngineError> {
        let interface = self.interface()?;
        let value = ((DESCRIPTOR_TYPE_CONFIGURATION as u16) << 8) | index as u16;

        // Header first for wTotalLength, then the combined descriptor.
        let header = interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Device,
                    request: GET_DESCRIPTOR,
                    value,
                    index: 0,
                    length: 9,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| EngineError::DescriptorReadFailed(e.to_string()))?;
        if header.len() < 4 {
            return Err(EngineError::DescriptorReadFailed(
                "short descriptor header".into(),
            ));
        }
        let total_length = u16::from_le_bytes([header[2], header[3]]);

        interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Device,
                    request: GET_DESCRIPTOR,
                    value,
                    index: 0,
                    length: total_length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| EngineError::DescriptorReadFailed(e.to_string()))
    }

    fn read_interface_names(&self) -> Result<InterfaceNameMap, EngineError> {
        let mut names: InterfaceNameMap = InterfaceNameMap::new();
        for configuration in self.device.configurations() {
            let config = configuration.configuration_value();
            for alt in configuration.interface_alt_settings() {
                let name = alt
                    .string_index()
                    .and_then(|idx| get_string_descriptor(&self.device, idx));
                names
                    .entry(config)
                    .or_default()
                    .entry(alt.interface_number())
                    .or_default()
                    .insert(alt.alternate_setting(), name);
            }
        }
        Ok(names)
    }

    #[instrument(level = "info", skip(self, firmware, progress),
        fields(len = firmware.len()))]
    fn do_download(
        &self,
        chunk_size: usize,
        firmware: &[u8],
        manifestation_tolerant: bool,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), EngineError> {
        let total = firmware.len() as u64;
        let mut done: u64 = 0;
        let mut block_num: u16 = 0;

        for chunk in firmware.chunks(chunk_size) {
            self.dfu_cmd_out(DFU_CMD_DNLOAD, block_num, chunk)?;
            self.poll_until_state(DFU_STATE_DNLOAD_IDLE)?;
            block_num = block_num.wrapping_add(1);
            done += chunk.len() as u64;
            progress(done, total);
        }

        // Zero-length block signals end of transfer and starts
        // manifestation.
        self.dfu_cmd_out(DFU_CMD_DNLOAD, block_num, &[])?;

        if manifestation_tolerant {
            loop {
                let st = self.get_status()?;
                if st.status != DFU_STATUS_OK {
                    return Err(EngineError::Status {
                        state: st.state,
                        status: st.status,
                    });
                }
                if st.state == DFU_STATE_DFU_IDLE || st.state == DFU_STATE_MANIFEST_WAIT_RESET {
                    break;
                }
                thread::sleep(Duration::from_millis(st.poll_timeout_ms as u64));
            }
        } else if let Err(e) = self.get_status() {
            // Intolerant devices detach during manifestation; a failed
            // poll here is the expected outcome.
            warn!(error = %e, "Status poll failed during manifestation");
        }

        info!(bytes = total, "Download complete");
        Ok(())
    }

    fn do_upload(&self, chunk_size: usize) -> Result<Vec<u8>, EngineError> {
        let mut firmware = Vec::new();
        let mut block_num: u16 = 0;
        loop {
            let chunk = self.dfu_cmd_in(DFU_CMD_UPLOAD, block_num, chunk_size as u16)?;
            let len = chunk.len();
            firmware.extend_from_slice(&chunk);
            if len < chunk_size {
                break;
            }
            block_num = block_num.wrapping_add(1);
        }
        Ok(firmware)
    }
}
