//! dfu-core: host-side USB DFU controller.
//!
//! This crate drives firmware updates on USB devices implementing the
//! DFU class: discovery and filtering, interface disambiguation,
//! functional-descriptor capability probing, and the multi-step download
//! transaction with status clearing and progress reporting.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Device**: identity and interface-alternate records
//! - **Engine**: the byte-level DFU collaborator behind a trait
//!   (nusb, mock)
//! - **Discovery / Probe / Chooser**: candidate filtering, capability
//!   derivation and interface disambiguation
//! - **Events**: observer pattern for UI decoupling
//! - **Session**: the connection-lifecycle state machine and download
//!   orchestrator
//! - **Format**: deterministic operator-visible text
//!
//! # Example
//!
//! ```no_run
//! use dfu_core::engine::NusbEngine;
//! use dfu_core::session::{DfuSession, SessionConfig};
//!
//! let mut session = DfuSession::new(NusbEngine::new(), SessionConfig::default());
//! session.auto_connect(Some(0x0483), None).expect("connect failed");
//! let firmware = std::fs::read("firmware.bin").expect("read failed");
//! session.download(&firmware).expect("download failed");
//! ```

pub mod chooser;
pub mod descriptor;
pub mod device;
pub mod discovery;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod probe;
pub mod session;
pub mod state;

// Re-exports for convenience
pub use chooser::{InterfaceChooser, NullChooser, choice_labels};
pub use descriptor::{ConfigDescriptor, DeviceCapabilities, parse_configuration_descriptor};
pub use device::{DeviceIdentity, DfuTarget, InterfaceMode, InterfaceSetting};
pub use discovery::{SelectionOutcome, filter_by_serial_or_vendor};
pub use download::DownloadJob;
pub use engine::{DfuEngine, DfuHandle, EngineError, MockEngine, NusbEngine};
pub use error::SessionError;
pub use events::{LogLevel, NullObserver, SessionEvent, SessionObserver, TracingObserver};
pub use session::{DEFAULT_CHUNK_SIZE, DfuSession, SessionConfig};
pub use state::ConnectionState;
