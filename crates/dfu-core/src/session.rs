//! DFU session - the connection-lifecycle state machine.
//!
//! One `DfuSession` exists per running program, owned by the application
//! root and passed by reference into every operation; the single
//! connection slot is enforced by construction rather than by a shared
//! global. All state mutation funnels through the guarded transitions
//! here, and every suspension point (open, descriptor read, chooser,
//! transfer) re-validates state on resumption.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chooser::InterfaceChooser;
use crate::descriptor::DeviceCapabilities;
use crate::device::{DeviceIdentity, InterfaceMode, InterfaceSetting};
use crate::discovery::{self, SelectionOutcome};
use crate::engine::{DfuEngine, DfuHandle};
use crate::error::SessionError;
use crate::events::{LogLevel, SessionEvent, SessionObserver, TracingObserver};
use crate::format;
use crate::probe;
use crate::state::ConnectionState;

pub const DEFAULT_CHUNK_SIZE: usize = 0x1000;

/// Operator preferences for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Vendor id used by automatic discovery.
    pub vendor_id: Option<u16>,
    /// Serial number used by automatic discovery; takes precedence over
    /// the vendor id.
    pub serial: Option<String>,
    /// Transfer chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Firmware image to download.
    pub firmware_path: Option<String>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: None,
            serial: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            firmware_path: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

pub(crate) struct ActiveConnection<H> {
    pub handle: H,
    pub identity: DeviceIdentity,
    pub setting: InterfaceSetting,
    pub capabilities: Option<DeviceCapabilities>,
    pub manifestation_tolerant: bool,
}

/// The single connection slot and its lifecycle state machine.
pub struct DfuSession<E: DfuEngine, O: SessionObserver> {
    pub(crate) engine: E,
    pub(crate) observer: Arc<O>,
    config: SessionConfig,
    pub(crate) state: ConnectionState,
    pub(crate) active: Option<ActiveConnection<E::Handle>>,
}

impl<E: DfuEngine> DfuSession<E, TracingObserver> {
    /// Create a new session with the default tracing observer.
    pub fn new(engine: E, config: SessionConfig) -> Self {
        Self::with_observer(engine, config, Arc::new(TracingObserver))
    }
}

impl<E: DfuEngine, O: SessionObserver> DfuSession<E, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(engine: E, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            engine,
            observer,
            config,
            state: ConnectionState::Disconnected,
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Identity of the currently tracked device, if any.
    pub fn tracked_identity(&self) -> Option<&DeviceIdentity> {
        self.active.as_ref().map(|a| &a.identity)
    }

    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.active.as_ref().and_then(|a| a.capabilities.as_ref())
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Transition to a new state.
    pub(crate) fn goto_state(&mut self, new_state: ConnectionState) {
        info!(from = %self.state, to = %new_state, "State transition");
        let from = self.state;
        self.state = new_state;
        self.emit(SessionEvent::StateChanged {
            from,
            to: new_state,
        });
    }

    fn status(&self, text: impl Into<String>) {
        self.emit(SessionEvent::Status(text.into()));
    }

    fn banner(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Banner(message.into()));
    }

    /// Landing-page path: discover, filter by serial or vendor id, and
    /// connect when the match is unique. Zero matches and ambiguity are
    /// statuses, not errors.
    pub fn auto_connect(
        &mut self,
        vid: Option<u16>,
        serial: Option<&str>,
    ) -> Result<(), SessionError> {
        if self.state != ConnectionState::Disconnected {
            debug!(state = %self.state, "auto_connect ignored");
            return Ok(());
        }

        let targets = discovery::enumerate(&self.engine).map_err(|e| {
            let err = SessionError::Open(e.to_string());
            self.banner(err.to_string());
            err
        })?;

        match discovery::filter_by_serial_or_vendor(&targets, vid, serial) {
            SelectionOutcome::NoMatch => {
                self.status("No device found.");
                info!("No device found.");
                Ok(())
            }
            SelectionOutcome::Ambiguous(count) => {
                self.status("Multiple DFU interfaces found.");
                info!(count = count, "Multiple DFU interfaces found.");
                Ok(())
            }
            SelectionOutcome::Unique(target) => {
                self.status("Connecting...");
                self.connect(&target.identity, &target.setting)
            }
        }
    }

    /// Operator-selected-device path. When the device exposes more than
    /// one DFU alternate, blocks on the chooser; cancel aborts back to
    /// Disconnected without a banner.
    pub fn connect_device(
        &mut self,
        identity: &DeviceIdentity,
        chooser: &dyn InterfaceChooser,
    ) -> Result<(), SessionError> {
        if self.state != ConnectionState::Disconnected {
            debug!(state = %self.state, "connect_device ignored");
            return Ok(());
        }

        let mut settings = self.engine.device_interfaces(identity).map_err(|e| {
            let err = SessionError::Open(e.to_string());
            self.banner(err.to_string());
            err
        })?;

        match settings.len() {
            0 => {
                self.status("The selected device does not have any USB DFU interfaces.");
                self.banner("Device does not support DFU");
                Ok(())
            }
            1 => self.connect(identity, &settings[0]),
            _ => {
                discovery::fix_interface_names(&self.engine, identity, &mut settings);
                self.goto_state(ConnectionState::AwaitingInterfaceChoice);

                let picked = chooser.choose(&settings);

                if self.state != ConnectionState::AwaitingInterfaceChoice {
                    debug!(state = %self.state, "Session changed while choosing");
                    return Ok(());
                }
                match picked {
                    Some(index) if index < settings.len() => {
                        self.connect(identity, &settings[index])
                    }
                    _ => {
                        self.goto_state(ConnectionState::Disconnected);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Open one interface alternate, probe its capabilities and reach
    /// Ready. An open failure is fatal to the attempt; a probe failure
    /// is swallowed and the connection proceeds with empty capabilities.
    pub fn connect(
        &mut self,
        identity: &DeviceIdentity,
        setting: &InterfaceSetting,
    ) -> Result<(), SessionError> {
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::AwaitingInterfaceChoice
        ) {
            debug!(state = %self.state, "connect ignored");
            return Ok(());
        }

        self.emit(SessionEvent::BannerCleared);
        self.goto_state(ConnectionState::Connecting);

        let handle = match self.engine.open(identity, setting) {
            Ok(handle) => handle,
            Err(e) => {
                let err = SessionError::Open(e.to_string());
                self.banner(err.to_string());
                self.status(err.to_string());
                self.goto_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        self.goto_state(ConnectionState::Probing);

        let capabilities = match probe::probe(&handle, setting.configuration) {
            Ok(caps) => caps,
            Err(e) => {
                warn!(error = %e, "Capability probe failed, continuing without");
                self.log(LogLevel::Warn, e.to_string());
                None
            }
        };

        let mut manifestation_tolerant = true;
        if let Some(caps) = &capabilities {
            self.emit(SessionEvent::Capabilities(caps.summary()));
            if caps.can_download {
                manifestation_tolerant = caps.manifestation_tolerant;
            }

            if setting.mode() == InterfaceMode::Dfu && !caps.can_download {
                info!("Device cannot download");
                let err = SessionError::Capability;
                self.banner(err.to_string());
                let mut handle = handle;
                self.goto_state(ConnectionState::Closing);
                if let Err(close_err) = handle.close() {
                    warn!(error = %close_err, "Close failed");
                }
                self.goto_state(ConnectionState::Disconnected);
                return Err(err);
            }
        }

        self.active = Some(ActiveConnection {
            handle,
            identity: identity.clone(),
            setting: setting.clone(),
            capabilities,
            manifestation_tolerant,
        });

        self.status("");
        self.emit(SessionEvent::DeviceSummary(format::device_summary(
            identity, setting,
        )));
        self.emit(SessionEvent::FirmwarePicker {
            enabled: setting.mode() == InterfaceMode::Dfu,
        });
        self.goto_state(ConnectionState::Ready);
        Ok(())
    }

    /// Operator-initiated disconnect. Idempotent: tearing down an
    /// already-cleared session is a no-op.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        let Some(mut active) = self.active.take() else {
            debug!("disconnect on a cleared session");
            return Ok(());
        };

        self.goto_state(ConnectionState::Closing);
        if let Err(e) = active.handle.close() {
            warn!(error = %e, "Close failed");
        }
        self.emit(SessionEvent::BannerCleared);
        self.emit(SessionEvent::FirmwarePicker { enabled: false });
        self.goto_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Asynchronous hardware-removal notification. Compared against the
    /// tracked identity; removal of an unrelated device produces no
    /// change. The notice is one-shot: the teardown clears the slot, so
    /// a duplicate notification is ignored.
    pub fn notify_removed(&mut self, identity: &DeviceIdentity) {
        let Some(active) = &self.active else {
            return;
        };
        if &active.identity != identity {
            return;
        }

        warn!("Device disconnected");
        self.banner("Device disconnected");
        self.status("Device disconnected");
        self.emit(SessionEvent::FirmwarePicker { enabled: false });
        // The hardware is gone; the handle is dropped, not closed.
        self.active = None;
        self.goto_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chooser::testing::ScriptedChooser;
    use crate::descriptor::tests::{sample_config, sample_config_with_attributes};
    use crate::engine::{EngineError, MockEngine};
    use crate::events::testing::RecordingObserver;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(0x0483, 0xDF11).with_serial("357A38663036")
    }

    fn setting(alt: u8, protocol: u8) -> InterfaceSetting {
        InterfaceSetting {
            configuration: 1,
            interface: 0,
            alt_setting: alt,
            protocol,
            name: Some("@Internal Flash".into()),
        }
    }

    fn session(
        engine: MockEngine,
    ) -> (
        DfuSession<MockEngine, RecordingObserver>,
        Arc<RecordingObserver>,
    ) {
        let observer = Arc::new(RecordingObserver::new());
        let session =
            DfuSession::with_observer(engine, SessionConfig::default(), Arc::clone(&observer));
        (session, observer)
    }

    #[test]
    fn test_auto_connect_no_match() {
        let engine = MockEngine::new();
        let (mut session, observer) = session(engine);

        session.auto_connect(Some(0x0483), None).unwrap();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(observer.statuses(), vec!["No device found.".to_string()]);
        assert!(observer.banners().is_empty());
    }

    #[test]
    fn test_auto_connect_unique_match_reaches_ready() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.handle().set_config_descriptor(sample_config(1));
        let (mut session, observer) = session(engine);

        session.auto_connect(Some(0x0483), None).unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(observer.statuses().contains(&"Connecting...".to_string()));
        assert!(observer.banners().is_empty());
        assert_eq!(session.tracked_identity(), Some(&identity()));
    }

    #[test]
    fn test_auto_connect_multiple_matches_is_ambiguous() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.add_target(identity(), setting(1, 2));
        let (mut session, observer) = session(engine);

        session.auto_connect(Some(0x0483), None).unwrap();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            observer.statuses(),
            vec!["Multiple DFU interfaces found.".to_string()]
        );
        assert!(session.tracked_identity().is_none());
    }

    #[test]
    fn test_auto_connect_by_serial_is_never_ambiguous() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.add_target(
            DeviceIdentity::new(0x0483, 0xDF11).with_serial("OTHER"),
            setting(0, 2),
        );
        engine.handle().set_config_descriptor(sample_config(1));
        let (mut session, _observer) = session(engine);

        session
            .auto_connect(Some(0x0483), Some("357A38663036"))
            .unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_open_failure_returns_to_disconnected() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.fail_open(EngineError::OpenFailed("access denied".into()));
        let (mut session, observer) = session(engine);

        let err = session.auto_connect(Some(0x0483), None).unwrap_err();

        assert!(matches!(err, SessionError::Open(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(observer.banners().len(), 1);
        assert!(observer.banners()[0].contains("access denied"));
    }

    #[test]
    fn test_probe_failure_is_swallowed() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine
            .handle()
            .fail_descriptor_read(EngineError::DescriptorReadFailed("stall".into()));
        let (mut session, observer) = session(engine);

        session.auto_connect(Some(0x0483), None).unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(session.capabilities().is_none());
        assert!(observer.banners().is_empty());
    }

    #[test]
    fn test_dfu_mode_without_download_support_never_reaches_ready() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        // attributes 0x0A: willDetach, no manifestation, no download
        engine
            .handle()
            .set_config_descriptor(sample_config_with_attributes(1, 0x0A));
        let handle = engine.handle();
        let (mut session, observer) = session(engine);

        let err = session.auto_connect(Some(0x0483), None).unwrap_err();

        assert_eq!(err, SessionError::Capability);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(handle.is_closed());
        assert_eq!(
            observer.banners(),
            vec!["Device does not accept firmware downloads".to_string()]
        );
    }

    #[test]
    fn test_runtime_mode_without_download_support_reaches_ready() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 1));
        engine
            .handle()
            .set_config_descriptor(sample_config_with_attributes(1, 0x0A));
        let (mut session, observer) = session(engine);

        session.auto_connect(Some(0x0483), None).unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        // Runtime interfaces cannot download directly: picker disabled.
        assert!(observer
            .events()
            .contains(&SessionEvent::FirmwarePicker { enabled: false }));
    }

    #[test]
    fn test_single_alternate_skips_chooser() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.handle().set_config_descriptor(sample_config(1));
        let chooser = ScriptedChooser::new(Some(0));
        let (mut session, _observer) = session(engine);

        session.connect_device(&identity(), &chooser).unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(chooser.times_presented(), 0);
    }

    #[test]
    fn test_multiple_alternates_present_chooser() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.add_target(identity(), setting(1, 2));
        engine.handle().set_config_descriptor(sample_config(1));
        let chooser = ScriptedChooser::new(Some(1));
        let (mut session, _observer) = session(engine);

        session.connect_device(&identity(), &chooser).unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(chooser.times_presented(), 1);
        // The chosen alternate is the one opened.
        let engine = &session.engine;
        let opened = engine.open_calls();
        assert_eq!(opened.last().unwrap().1.alt_setting, 1);
    }

    #[test]
    fn test_chooser_cancel_aborts_without_banner() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.add_target(identity(), setting(1, 2));
        let chooser = ScriptedChooser::new(None);
        let (mut session, observer) = session(engine);

        session.connect_device(&identity(), &chooser).unwrap();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(observer.banners().is_empty());
        assert!(session.engine.open_calls().is_empty());
    }

    #[test]
    fn test_device_without_dfu_interfaces() {
        let engine = MockEngine::new();
        let chooser = ScriptedChooser::new(Some(0));
        let (mut session, observer) = session(engine);

        session.connect_device(&identity(), &chooser).unwrap();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            observer.banners(),
            vec!["Device does not support DFU".to_string()]
        );
    }

    #[test]
    fn test_unrelated_removal_is_ignored() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.handle().set_config_descriptor(sample_config(1));
        let (mut session, observer) = session(engine);
        session.auto_connect(Some(0x0483), None).unwrap();

        let unrelated = DeviceIdentity::new(0x1234, 0x5678);
        session.notify_removed(&unrelated);

        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(observer.banners().is_empty());
    }

    #[test]
    fn test_tracked_removal_tears_down_once() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.handle().set_config_descriptor(sample_config(1));
        let (mut session, observer) = session(engine);
        session.auto_connect(Some(0x0483), None).unwrap();

        session.notify_removed(&identity());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(observer.banners(), vec!["Device disconnected".to_string()]);

        // One-shot: a duplicate notification changes nothing.
        session.notify_removed(&identity());
        assert_eq!(observer.banners().len(), 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting(0, 2));
        engine.handle().set_config_descriptor(sample_config(1));
        let handle = engine.handle();
        let (mut session, _observer) = session(engine);
        session.auto_connect(Some(0x0483), None).unwrap();

        session.disconnect().unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(handle.is_closed());

        session.disconnect().unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SessionConfig {
            vendor_id: Some(0x0483),
            serial: Some("357A38663036".into()),
            chunk_size: 2048,
            firmware_path: Some("firmware.bin".into()),
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.vendor_id, Some(0x0483));
        assert_eq!(parsed.chunk_size, 2048);
    }

    #[test]
    fn test_config_chunk_size_defaults() {
        let parsed: SessionConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
