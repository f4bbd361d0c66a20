//! DFU functional descriptor probing.
//!
//! Runs once per connection, right after a successful open. The probe
//! reads configuration descriptor index 0 through the handle and searches
//! it for the functional descriptor of the active configuration.
//!
//! A read or parse failure here is reported to the caller but is not
//! fatal to the connection; an open failure is. The session swallows the
//! probe error and continues with empty capabilities.

use tracing::debug;

use crate::descriptor::{
    DeviceCapabilities, SubDescriptor, parse_configuration_descriptor,
};
use crate::engine::DfuHandle;
use crate::error::SessionError;

/// Derive the device capabilities for one connection.
///
/// Returns `Ok(None)` when the descriptor parses but carries no DFU
/// functional descriptor for `active_configuration`, and `Err` when the
/// read or parse itself fails.
pub fn probe<H: DfuHandle>(
    handle: &H,
    active_configuration: u8,
) -> Result<Option<DeviceCapabilities>, SessionError> {
    // TODO: read the selected configuration's descriptor index instead
    // of assuming it is the first one.
    let raw = handle
        .read_configuration_descriptor(0)
        .map_err(|e| SessionError::Probe(e.to_string()))?;
    let config = parse_configuration_descriptor(&raw)?;

    if config.configuration_value != active_configuration {
        debug!(
            parsed = config.configuration_value,
            active = active_configuration,
            "Configuration descriptor does not match the active configuration"
        );
        return Ok(None);
    }

    let capabilities = config.descriptors.iter().find_map(|desc| match desc {
        SubDescriptor::Functional(func) => Some(DeviceCapabilities::from(func)),
        SubDescriptor::Other { .. } => None,
    });

    if let Some(caps) = &capabilities {
        debug!(summary = %caps.summary(), "Probed DFU capabilities");
    }
    Ok(capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::sample_config;
    use crate::engine::{EngineError, MockEngine};

    #[test]
    fn test_probe_derives_capabilities() {
        let engine = MockEngine::new();
        let handle = engine.handle();
        handle.set_config_descriptor(sample_config(1));

        let caps = probe(&handle, 1).unwrap().expect("capabilities");
        assert!(caps.can_download);
        assert!(caps.will_detach);
        assert_eq!(caps.dfu_version, 0x011A);
    }

    #[test]
    fn test_probe_read_failure_is_error() {
        let engine = MockEngine::new();
        let handle = engine.handle();
        handle.fail_descriptor_read(EngineError::DescriptorReadFailed("stall".into()));

        assert!(matches!(probe(&handle, 1), Err(SessionError::Probe(_))));
    }

    #[test]
    fn test_probe_configuration_mismatch_is_empty() {
        let engine = MockEngine::new();
        let handle = engine.handle();
        handle.set_config_descriptor(sample_config(2));

        assert_eq!(probe(&handle, 1).unwrap(), None);
    }
}
