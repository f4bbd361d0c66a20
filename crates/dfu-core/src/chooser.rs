//! Interface disambiguation.
//!
//! When a physical device exposes more than one DFU interface alternate,
//! the session blocks on an `InterfaceChooser` until the operator picks
//! exactly one choice or cancels. The UI layer implements this trait; a
//! scripted implementation serves the tests.

use crate::device::InterfaceSetting;
use crate::format::interface_alternate_label;

pub trait InterfaceChooser {
    /// Present the choices and block until the operator picks one or
    /// cancels. `None` is cancel: the session returns to Disconnected
    /// without raising an error.
    fn choose(&self, choices: &[InterfaceSetting]) -> Option<usize>;
}

/// Labels shown for each choice, in presentation order.
pub fn choice_labels(choices: &[InterfaceSetting]) -> Vec<String> {
    choices.iter().map(interface_alternate_label).collect()
}

/// Chooser that always cancels.
pub struct NullChooser;

impl InterfaceChooser for NullChooser {
    fn choose(&self, _choices: &[InterfaceSetting]) -> Option<usize> {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_labels_deterministic() {
        let choices = vec![
            InterfaceSetting {
                configuration: 1,
                interface: 0,
                alt_setting: 0,
                protocol: 2,
                name: Some("@Internal Flash".into()),
            },
            InterfaceSetting {
                configuration: 1,
                interface: 0,
                alt_setting: 1,
                protocol: 1,
                name: None,
            },
        ];
        assert_eq!(
            choice_labels(&choices),
            vec![
                "DFU: cfg=1, intf=0, alt=0, name=\"@Internal Flash\"",
                "Runtime: cfg=1, intf=0, alt=1, name=\"UNKNOWN\"",
            ]
        );
    }
}
