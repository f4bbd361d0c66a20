//! Session-level error taxonomy.
//!
//! Every failure crossing an asynchronous boundary is converted into one
//! of these before it reaches presentation; none of them is fatal to the
//! process and every path returns the session to Disconnected or Ready.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Device unavailable or access denied. Fatal to the connection
    /// attempt.
    #[error("Failed to open device: {0}")]
    Open(String),

    /// Descriptor read or parse failure. Swallowed by the caller:
    /// capabilities stay empty and the connection proceeds.
    #[error("Failed to read DFU descriptor: {0}")]
    Probe(String),

    /// DFU-mode interface whose functional descriptor reports no
    /// download support.
    #[error("Device does not accept firmware downloads")]
    Capability,

    /// Download failure. Non-fatal; the session returns to Ready.
    #[error("{0}")]
    Transfer(String),

    /// Hardware removal of the tracked device.
    #[error("Device disconnected")]
    UnexpectedDisconnect,
}

/// Messages produced as expected side effects of a deliberate disconnect
/// while a transfer is in flight. These restore the form state but never
/// populate the error banner.
const BENIGN_DISCONNECT_MESSAGES: [&str; 2] = [
    "The transfer was cancelled",
    "The device must be opened first",
];

pub fn is_benign_disconnect_message(message: &str) -> bool {
    BENIGN_DISCONNECT_MESSAGES
        .iter()
        .any(|benign| message.contains(benign))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_messages() {
        assert!(is_benign_disconnect_message("The transfer was cancelled"));
        assert!(is_benign_disconnect_message(
            "usb: The transfer was cancelled."
        ));
        assert!(is_benign_disconnect_message(
            "The device must be opened first"
        ));
    }

    #[test]
    fn test_reportable_messages() {
        assert!(!is_benign_disconnect_message("DFU status error: code 10"));
        assert!(!is_benign_disconnect_message("transfer cancelled"));
    }

    #[test]
    fn test_capability_error_text() {
        assert_eq!(
            SessionError::Capability.to_string(),
            "Device does not accept firmware downloads"
        );
    }
}
