//! Connection lifecycle states.

use std::fmt;

/// State of the single connection slot. Mutated only by
/// [`crate::session::DfuSession`]; at most one non-`Disconnected` state
/// exists per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No device attached to the session.
    #[default]
    Disconnected,
    /// Opening the device exclusively.
    Connecting,
    /// Reading the DFU functional descriptor.
    Probing,
    /// Blocked on the operator picking one of several DFU alternates.
    AwaitingInterfaceChoice,
    /// Connected; a download may start.
    Ready,
    /// A download transaction is in flight.
    Downloading,
    /// Releasing the host handle.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Probing => write!(f, "PROBING"),
            ConnectionState::AwaitingInterfaceChoice => write!(f, "AWAITING_INTERFACE_CHOICE"),
            ConnectionState::Ready => write!(f, "READY"),
            ConnectionState::Downloading => write!(f, "DOWNLOADING"),
            ConnectionState::Closing => write!(f, "CLOSING"),
        }
    }
}

impl ConnectionState {
    /// True for every state that tracks an open or opening device.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(ConnectionState::Ready.is_active());
    }
}
