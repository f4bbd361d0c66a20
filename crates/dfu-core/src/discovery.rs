//! Device discovery and candidate filtering.

use tracing::{debug, warn};

use crate::device::{DfuTarget, InterfaceSetting};
use crate::engine::{DfuEngine, DfuHandle, EngineError};

/// Outcome of filtering the discovered targets against the operator's
/// vendor-id / serial selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// Nothing matched. A status, not an error.
    NoMatch,
    Unique(DfuTarget),
    /// More than one vendor-only match; reported rather than guessed.
    Ambiguous(usize),
}

/// All host-visible DFU interface alternates.
pub fn enumerate<E: DfuEngine>(engine: &E) -> Result<Vec<DfuTarget>, EngineError> {
    engine.list_interfaces()
}

/// Filter targets by serial or vendor id. A serial match takes precedence
/// over a vendor-id match and is never ambiguous.
pub fn filter_by_serial_or_vendor(
    targets: &[DfuTarget],
    vid: Option<u16>,
    serial: Option<&str>,
) -> SelectionOutcome {
    if let Some(serial) = serial {
        return match targets
            .iter()
            .find(|t| t.identity.serial.as_deref() == Some(serial))
        {
            Some(target) => SelectionOutcome::Unique(target.clone()),
            None => SelectionOutcome::NoMatch,
        };
    }

    let matches: Vec<&DfuTarget> = match vid {
        Some(vid) => targets
            .iter()
            .filter(|t| t.identity.vendor_id == vid)
            .collect(),
        None => targets.iter().collect(),
    };

    match matches.len() {
        0 => SelectionOutcome::NoMatch,
        1 => SelectionOutcome::Unique(matches[0].clone()),
        n => SelectionOutcome::Ambiguous(n),
    }
}

/// Patch interface names that the configuration listing left empty, by
/// fetching the string descriptors through a temporarily opened handle.
/// Best-effort: on any failure the names stay empty and the chooser
/// shows them as UNKNOWN.
pub fn fix_interface_names<E: DfuEngine>(
    engine: &E,
    identity: &crate::device::DeviceIdentity,
    settings: &mut [InterfaceSetting],
) {
    if settings.iter().all(|s| s.name.is_some()) {
        return;
    }

    let Some(first) = settings.first().cloned() else {
        return;
    };
    let mut handle = match engine.open(identity, &first) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "Could not open device to read interface names");
            return;
        }
    };
    let names = handle.read_interface_names();
    let _ = handle.close();

    let names = match names {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Interface name read failed");
            return;
        }
    };

    for setting in settings.iter_mut().filter(|s| s.name.is_none()) {
        setting.name = names
            .get(&setting.configuration)
            .and_then(|intfs| intfs.get(&setting.interface))
            .and_then(|alts| alts.get(&setting.alt_setting))
            .cloned()
            .flatten();
    }
    debug!(count = settings.len(), "Interface names resolved");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::engine::MockEngine;

    fn target(vid: u16, serial: Option<&str>, alt: u8) -> DfuTarget {
        DfuTarget {
            identity: DeviceIdentity {
                vendor_id: vid,
                product_id: 0xDF11,
                serial: serial.map(String::from),
                manufacturer: None,
                product: None,
            },
            setting: InterfaceSetting {
                configuration: 1,
                interface: 0,
                alt_setting: alt,
                protocol: 2,
                name: None,
            },
        }
    }

    #[test]
    fn test_no_match() {
        let targets = vec![target(0x0483, None, 0)];
        assert_eq!(
            filter_by_serial_or_vendor(&targets, Some(0x1234), None),
            SelectionOutcome::NoMatch
        );
        assert_eq!(
            filter_by_serial_or_vendor(&[], Some(0x0483), None),
            SelectionOutcome::NoMatch
        );
    }

    #[test]
    fn test_unique_vendor_match() {
        let targets = vec![target(0x0483, None, 0), target(0x1234, None, 0)];
        assert_eq!(
            filter_by_serial_or_vendor(&targets, Some(0x0483), None),
            SelectionOutcome::Unique(targets[0].clone())
        );
    }

    #[test]
    fn test_multiple_vendor_matches_are_ambiguous() {
        let targets = vec![target(0x0483, None, 0), target(0x0483, None, 1)];
        assert_eq!(
            filter_by_serial_or_vendor(&targets, Some(0x0483), None),
            SelectionOutcome::Ambiguous(2)
        );
    }

    #[test]
    fn test_serial_match_takes_precedence() {
        let targets = vec![
            target(0x0483, Some("AAAA"), 0),
            target(0x0483, Some("BBBB"), 1),
        ];
        // Vendor-only filtering would be ambiguous; an exact serial
        // match never is.
        assert_eq!(
            filter_by_serial_or_vendor(&targets, Some(0x0483), Some("BBBB")),
            SelectionOutcome::Unique(targets[1].clone())
        );
    }

    #[test]
    fn test_serial_mismatch_is_no_match() {
        let targets = vec![target(0x0483, Some("AAAA"), 0)];
        assert_eq!(
            filter_by_serial_or_vendor(&targets, Some(0x0483), Some("CCCC")),
            SelectionOutcome::NoMatch
        );
    }

    #[test]
    fn test_fix_interface_names() {
        let engine = MockEngine::new();
        let t = target(0x0483, None, 0);
        engine.add_target(t.identity.clone(), t.setting.clone());

        let mut names = crate::engine::InterfaceNameMap::new();
        names
            .entry(1)
            .or_default()
            .entry(0)
            .or_default()
            .insert(0, Some("@Internal Flash".to_string()));
        engine.handle().set_interface_names(names);

        let mut settings = vec![t.setting.clone()];
        fix_interface_names(&engine, &t.identity, &mut settings);
        assert_eq!(settings[0].name.as_deref(), Some("@Internal Flash"));
        assert!(engine.handle().is_closed());
    }
}
