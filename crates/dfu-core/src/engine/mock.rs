//! Mock DFU engine for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{
    DFU_STATE_DFU_IDLE, DfuEngine, DfuHandle, DfuStatus, EngineError, InterfaceNameMap,
};
use crate::device::{DeviceIdentity, DfuTarget, InterfaceSetting};

/// Captured `do_download` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCall {
    pub chunk_size: usize,
    pub firmware_len: usize,
    pub manifestation_tolerant: bool,
}

#[derive(Default)]
struct HandleState {
    status_queue: Mutex<VecDeque<Result<DfuStatus, EngineError>>>,
    clear_status_failure: Mutex<Option<EngineError>>,
    clear_status_calls: Mutex<usize>,
    config_descriptor: Mutex<Option<Result<Vec<u8>, EngineError>>>,
    interface_names: Mutex<InterfaceNameMap>,
    download_failure: Mutex<Option<EngineError>>,
    download_calls: Mutex<Vec<DownloadCall>>,
    upload_payload: Mutex<Vec<u8>>,
    detach_calls: Mutex<usize>,
    disconnected: Mutex<bool>,
    closed: Mutex<bool>,
}

/// Mock engine for unit testing session logic: scripted responses,
/// captured calls, simulated disconnect.
pub struct MockEngine {
    targets: Mutex<Vec<DfuTarget>>,
    open_failure: Mutex<Option<EngineError>>,
    open_calls: Mutex<Vec<(DeviceIdentity, InterfaceSetting)>>,
    handle: Arc<HandleState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(Vec::new()),
            open_failure: Mutex::new(None),
            open_calls: Mutex::new(Vec::new()),
            handle: Arc::new(HandleState::default()),
        }
    }

    pub fn add_target(&self, identity: DeviceIdentity, setting: InterfaceSetting) {
        self.targets.lock().unwrap().push(DfuTarget { identity, setting });
    }

    /// Make the next (and every) open attempt fail.
    pub fn fail_open(&self, error: EngineError) {
        *self.open_failure.lock().unwrap() = Some(error);
    }

    /// Scripting/assertion view onto the handle this engine hands out.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.handle),
        }
    }

    pub fn open_calls(&self) -> Vec<(DeviceIdentity, InterfaceSetting)> {
        self.open_calls.lock().unwrap().clone()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuEngine for MockEngine {
    type Handle = MockHandle;

    fn list_interfaces(&self) -> Result<Vec<DfuTarget>, EngineError> {
        Ok(self.targets.lock().unwrap().clone())
    }

    fn device_interfaces(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Vec<InterfaceSetting>, EngineError> {
        Ok(self
            .targets
            .lock()
            .unwrap()
            .iter()
            .filter(|t| &t.identity == identity)
            .map(|t| t.setting.clone())
            .collect())
    }

    fn open(
        &self,
        identity: &DeviceIdentity,
        setting: &InterfaceSetting,
    ) -> Result<MockHandle, EngineError> {
        if let Some(err) = self.open_failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.open_calls
            .lock()
            .unwrap()
            .push((identity.clone(), setting.clone()));
        *self.handle.closed.lock().unwrap() = false;
        Ok(self.handle())
    }
}

/// Shared-state handle; clones observe the same scripted engine.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<HandleState>,
}

impl MockHandle {
    pub fn queue_status(&self, status: DfuStatus) {
        self.state.status_queue.lock().unwrap().push_back(Ok(status));
    }

    pub fn queue_status_error(&self, error: EngineError) {
        self.state.status_queue.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_clear_status(&self, error: EngineError) {
        *self.state.clear_status_failure.lock().unwrap() = Some(error);
    }

    pub fn set_config_descriptor(&self, raw: Vec<u8>) {
        *self.state.config_descriptor.lock().unwrap() = Some(Ok(raw));
    }

    pub fn fail_descriptor_read(&self, error: EngineError) {
        *self.state.config_descriptor.lock().unwrap() = Some(Err(error));
    }

    pub fn set_interface_names(&self, names: InterfaceNameMap) {
        *self.state.interface_names.lock().unwrap() = names;
    }

    pub fn fail_download(&self, error: EngineError) {
        *self.state.download_failure.lock().unwrap() = Some(error);
    }

    pub fn set_upload_payload(&self, payload: Vec<u8>) {
        *self.state.upload_payload.lock().unwrap() = payload;
    }

    /// Simulate device removal; subsequent operations fail.
    pub fn disconnect(&self) {
        *self.state.disconnected.lock().unwrap() = true;
    }

    pub fn download_calls(&self) -> Vec<DownloadCall> {
        self.state.download_calls.lock().unwrap().clone()
    }

    pub fn clear_status_calls(&self) -> usize {
        *self.state.clear_status_calls.lock().unwrap()
    }

    pub fn detach_calls(&self) -> usize {
        *self.state.detach_calls.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.closed.lock().unwrap()
    }

    fn check_connected(&self) -> Result<(), EngineError> {
        if *self.state.disconnected.lock().unwrap() {
            Err(EngineError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl DfuHandle for MockHandle {
    fn close(&mut self) -> Result<(), EngineError> {
        *self.state.closed.lock().unwrap() = true;
        Ok(())
    }

    fn detach(&self, _timeout_ms: u16) -> Result<(), EngineError> {
        self.check_connected()?;
        *self.state.detach_calls.lock().unwrap() += 1;
        Ok(())
    }

    fn get_status(&self) -> Result<DfuStatus, EngineError> {
        self.check_connected()?;
        self.state
            .status_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(DfuStatus {
                status: 0,
                poll_timeout_ms: 0,
                state: DFU_STATE_DFU_IDLE,
            }))
    }

    fn clear_status(&self) -> Result<(), EngineError> {
        self.check_connected()?;
        *self.state.clear_status_calls.lock().unwrap() += 1;
        match self.state.clear_status_failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read_configuration_descriptor(&self, _index: u8) -> Result<Vec<u8>, EngineError> {
        self.check_connected()?;
        match self.state.config_descriptor.lock().unwrap().clone() {
            Some(result) => result,
            None => Err(EngineError::DescriptorReadFailed(
                "no descriptor scripted".into(),
            )),
        }
    }

    fn read_interface_names(&self) -> Result<InterfaceNameMap, EngineError> {
        self.check_connected()?;
        Ok(self.state.interface_names.lock().unwrap().clone())
    }

    fn do_download(
        &self,
        chunk_size: usize,
        firmware: &[u8],
        manifestation_tolerant: bool,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), EngineError> {
        self.check_connected()?;
        self.state.download_calls.lock().unwrap().push(DownloadCall {
            chunk_size,
            firmware_len: firmware.len(),
            manifestation_tolerant,
        });
        if let Some(err) = self.state.download_failure.lock().unwrap().clone() {
            return Err(err);
        }
        let total = firmware.len() as u64;
        let mut done: u64 = 0;
        for chunk in firmware.chunks(chunk_size.max(1)) {
            done += chunk.len() as u64;
            progress(done, total);
        }
        Ok(())
    }

    fn do_upload(&self, _chunk_size: usize) -> Result<Vec<u8>, EngineError> {
        self.check_connected()?;
        Ok(self.state.upload_payload.lock().unwrap().clone())
    }
}
