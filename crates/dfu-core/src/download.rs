//! Download orchestration.
//!
//! Drives one firmware-transfer transaction against the session's
//! borrowed handle: status clearing, progress reporting, delegation to
//! the engine's transfer path, and failure classification. The handle is
//! borrowed for exactly one job and never retained.

use tracing::{debug, info, warn};

use crate::engine::{DfuEngine, DfuHandle, EngineError};
use crate::error::{SessionError, is_benign_disconnect_message};
use crate::events::{LogLevel, SessionEvent, SessionObserver};
use crate::session::DfuSession;
use crate::state::ConnectionState;

/// One firmware-transfer transaction.
#[derive(Debug, Clone, Copy)]
pub struct DownloadJob<'a> {
    pub firmware: &'a [u8],
    pub chunk_size: usize,
    /// Copied from the device capabilities at connect time.
    pub manifestation_tolerant: bool,
}

impl<E: DfuEngine, O: SessionObserver> DfuSession<E, O> {
    /// Run one download transaction.
    ///
    /// A no-op unless the session is Ready with non-empty firmware; in
    /// particular a second invocation while Downloading is rejected
    /// here. On success the session closes itself; on failure it
    /// returns to Ready with the form re-enabled, and the two benign
    /// disconnect message categories are suppressed rather than shown.
    pub fn download(&mut self, firmware: &[u8]) -> Result<(), SessionError> {
        if self.state != ConnectionState::Ready {
            debug!(state = %self.state, "download ignored");
            return Ok(());
        }
        if firmware.is_empty() {
            warn!("No firmware loaded");
            self.log(LogLevel::Warn, "No firmware loaded");
            return Ok(());
        }

        let Some(active) = self.active.as_ref() else {
            debug!("download without an active connection");
            return Ok(());
        };
        let job = DownloadJob {
            firmware,
            chunk_size: self.chunk_size(),
            manifestation_tolerant: active.manifestation_tolerant,
        };

        self.emit(SessionEvent::BannerCleared);
        self.clear_error_status();

        self.goto_state(ConnectionState::Downloading);
        self.emit(SessionEvent::FirmwarePicker { enabled: false });

        let result = self.run_transfer(&job);

        // Re-validate after the suspension: a disconnect notice that
        // landed mid-transfer already tore the session down and
        // explains any transfer error, so it is not reported again.
        if self.state == ConnectionState::Disconnected || self.active.is_none() {
            debug!("Session torn down during transfer");
            return Ok(());
        }

        self.goto_state(ConnectionState::Ready);
        self.emit(SessionEvent::FirmwarePicker { enabled: true });

        match result {
            Ok(()) => {
                info!("Done!");
                self.log(LogLevel::Info, "Done!");
                self.emit(SessionEvent::DownloadComplete);
                self.disconnect()?;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.log(LogLevel::Error, message.clone());
                if is_benign_disconnect_message(&message) {
                    debug!(error = %message, "Suppressed benign transfer failure");
                    Ok(())
                } else {
                    self.emit(SessionEvent::Banner(message.clone()));
                    Err(SessionError::Transfer(message))
                }
            }
        }
    }

    /// Best-effort recovery from a lingering error state. Never fatal.
    fn clear_error_status(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let cleared = active.handle.get_status().and_then(|st| {
            if st.is_error() {
                active.handle.clear_status()
            } else {
                Ok(())
            }
        });
        if let Err(e) = cleared {
            warn!(error = %e, "Failed to clear status");
            self.log(LogLevel::Warn, "Failed to clear status");
        }
    }

    fn run_transfer(&self, job: &DownloadJob<'_>) -> Result<(), EngineError> {
        let active = self.active.as_ref().ok_or(EngineError::NotOpen)?;
        let observer = std::sync::Arc::clone(&self.observer);
        active.handle.do_download(
            job.chunk_size,
            job.firmware,
            job.manifestation_tolerant,
            &mut |done, total| {
                observer.on_event(&SessionEvent::Progress { done, total });
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::descriptor::tests::sample_config;
    use crate::device::{DeviceIdentity, InterfaceSetting};
    use crate::engine::{DFU_STATE_ERROR, DfuStatus, MockEngine, MockHandle};
    use crate::events::testing::RecordingObserver;
    use crate::session::{DfuSession, SessionConfig};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(0x0483, 0xDF11).with_serial("357A38663036")
    }

    fn setting() -> InterfaceSetting {
        InterfaceSetting {
            configuration: 1,
            interface: 0,
            alt_setting: 0,
            protocol: 2,
            name: Some("@Internal Flash".into()),
        }
    }

    fn ready_session() -> (
        DfuSession<MockEngine, RecordingObserver>,
        Arc<RecordingObserver>,
        MockHandle,
    ) {
        let engine = MockEngine::new();
        engine.add_target(identity(), setting());
        engine.handle().set_config_descriptor(sample_config(1));
        let handle = engine.handle();
        let observer = Arc::new(RecordingObserver::new());
        let mut session =
            DfuSession::with_observer(engine, SessionConfig::default(), Arc::clone(&observer));
        session.auto_connect(Some(0x0483), None).unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);
        (session, observer, handle)
    }

    #[test]
    fn test_download_requires_ready() {
        let engine = MockEngine::new();
        let handle = engine.handle();
        let observer = Arc::new(RecordingObserver::new());
        let mut session =
            DfuSession::with_observer(engine, SessionConfig::default(), Arc::clone(&observer));

        session.download(&[1, 2, 3]).unwrap();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(handle.download_calls().is_empty());
    }

    #[test]
    fn test_empty_firmware_is_a_noop() {
        let (mut session, _observer, handle) = ready_session();
        session.download(&[]).unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(handle.download_calls().is_empty());
    }

    #[test]
    fn test_successful_download_closes_session() {
        let (mut session, observer, handle) = ready_session();

        session.download(&[0u8; 10000]).unwrap();

        let calls = handle.download_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].chunk_size, 0x1000);
        assert_eq!(calls[0].firmware_len, 10000);
        // sample_config has manifestationTolerant clear.
        assert!(!calls[0].manifestation_tolerant);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(handle.is_closed());
        assert!(observer.events().contains(&SessionEvent::DownloadComplete));
        assert!(observer.banners().is_empty());

        let progress: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Progress { done, total } => Some((done, total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress.last(), Some(&(10000, 10000)));
    }

    #[test]
    fn test_error_status_is_cleared_first() {
        let (mut session, _observer, handle) = ready_session();
        handle.queue_status(DfuStatus {
            status: 0x0E,
            poll_timeout_ms: 0,
            state: DFU_STATE_ERROR,
        });

        session.download(&[1, 2, 3]).unwrap();

        assert_eq!(handle.clear_status_calls(), 1);
        assert_eq!(handle.download_calls().len(), 1);
    }

    #[test]
    fn test_clear_status_failure_is_only_a_warning() {
        let (mut session, observer, handle) = ready_session();
        handle.queue_status(DfuStatus {
            status: 0x0E,
            poll_timeout_ms: 0,
            state: DFU_STATE_ERROR,
        });
        handle.fail_clear_status(EngineError::ControlFailed("stall".into()));

        session.download(&[1, 2, 3]).unwrap();

        // The transfer still ran and the failure stayed out of the
        // banner.
        assert_eq!(handle.download_calls().len(), 1);
        assert!(observer.banners().is_empty());
        assert!(observer.events().contains(&SessionEvent::Log {
            level: LogLevel::Warn,
            message: "Failed to clear status".into(),
        }));
    }

    #[test]
    fn test_reportable_failure_restores_ready_with_banner() {
        let (mut session, observer, handle) = ready_session();
        handle.fail_download(EngineError::Status {
            state: DFU_STATE_ERROR,
            status: 0x0E,
        });

        let err = session.download(&[1, 2, 3]).unwrap_err();

        assert!(matches!(err, SessionError::Transfer(_)));
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(observer.banners().len(), 1);
        assert!(observer.banners()[0].contains("DFU status error"));
    }

    #[test]
    fn test_cancelled_transfer_is_suppressed() {
        let (mut session, observer, handle) = ready_session();
        handle.fail_download(EngineError::TransferCancelled);

        session.download(&[1, 2, 3]).unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(observer.banners().is_empty());
        // Form state restored all the same.
        assert!(observer
            .events()
            .contains(&SessionEvent::FirmwarePicker { enabled: true }));
    }

    #[test]
    fn test_not_open_failure_is_suppressed() {
        let (mut session, observer, handle) = ready_session();
        handle.fail_download(EngineError::NotOpen);

        session.download(&[1, 2, 3]).unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(observer.banners().is_empty());
    }
}
