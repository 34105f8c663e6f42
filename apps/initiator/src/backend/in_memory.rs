//! In-memory backend with scriptable devices.
//!
//! Objects live in the backend, not in sessions, so they survive a
//! close/reopen the same way files on a real phone do. Failure switches let
//! tests drive every error path of the session core without hardware. Hang
//! switches make calls wait forever, the way an unresponsive phone does.

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BackendError, DeviceBackend, ProtocolSession};
use crate::device::{DeviceHandle, DeviceInfo, ObjectHandle, StorageId, StorageUnit, TransferObject};

/// Storage id the default in-memory storage uses (same shape Android reports).
const DEFAULT_STORAGE_ID: u32 = 0x10001;

/// Configuration for one simulated device.
#[derive(Debug, Clone)]
pub struct InMemoryDevice {
    id: String,
    info: DeviceInfo,
    storages: Vec<StorageUnit>,
}

impl InMemoryDevice {
    /// A device with one writable "Internal shared storage".
    pub fn new(device: &DeviceHandle) -> Self {
        Self {
            id: device.id.clone(),
            info: DeviceInfo::default(),
            storages: vec![StorageUnit {
                id: StorageId(DEFAULT_STORAGE_ID),
                description: "Internal shared storage".to_string(),
                total_bytes: 64_000_000_000,
                available_bytes: 32_000_000_000,
                is_read_only: false,
            }],
        }
    }

    /// A device that exposes no storage at all (locked phone).
    pub fn without_storage(mut self) -> Self {
        self.storages.clear();
        self
    }

    /// Identity strings the device reports once a session is open.
    pub fn with_info(mut self, manufacturer: &str, model: &str, serial_number: &str) -> Self {
        self.info = DeviceInfo::from_descriptors(manufacturer, model, serial_number);
        self
    }

    pub fn with_storage(mut self, storage: StorageUnit) -> Self {
        self.storages.push(storage);
        self
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    storage: StorageId,
    handle: ObjectHandle,
    name: String,
    parent: Option<ObjectHandle>,
    is_folder: bool,
    data: Vec<u8>,
}

impl StoredObject {
    fn to_transfer_object(&self) -> TransferObject {
        TransferObject {
            storage: self.storage,
            handle: self.handle,
            name: self.name.clone(),
            size: self.data.len() as u64,
            is_folder: self.is_folder,
            parent: self.parent,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    info: DeviceInfo,
    storages: Vec<StorageUnit>,
    objects: Vec<StoredObject>,
    present: bool,
    fail_channel_open: bool,
    fail_session_open: bool,
    fail_storage_enumeration: bool,
    reject_writes: bool,
    hang_channel_open: bool,
    hang_transfers: bool,
    hang_close: bool,
}

#[derive(Debug, Default)]
struct BackendState {
    devices: HashMap<String, DeviceState>,
    next_handle: u32,
    channels_opened: usize,
    sessions_opened: usize,
    releases: usize,
}

impl BackendState {
    fn device(&mut self, device_id: &str) -> Result<&mut DeviceState, BackendError> {
        match self.devices.get_mut(device_id) {
            Some(device) if device.present => Ok(device),
            _ => Err(BackendError::Disconnected),
        }
    }

    fn allocate_handle(&mut self) -> ObjectHandle {
        self.next_handle += 1;
        ObjectHandle(self.next_handle)
    }
}

/// Backend over simulated devices. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

fn lock(state: &Mutex<BackendState>) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugs in a simulated device.
    pub fn add_device(&self, device: InMemoryDevice) {
        let mut state = lock(&self.state);
        let entry = state.devices.entry(device.id).or_default();
        entry.info = device.info;
        entry.storages = device.storages;
        entry.present = true;
    }

    /// Unplugs a device. Open sessions on it start failing with `Disconnected`.
    pub fn remove_device(&self, device_id: &str) {
        if let Some(device) = lock(&self.state).devices.get_mut(device_id) {
            device.present = false;
        }
    }

    /// Seeds an object directly on the device.
    pub fn put_object(
        &self,
        device_id: &str,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
        data: &[u8],
    ) -> ObjectHandle {
        let mut state = lock(&self.state);
        let handle = state.allocate_handle();
        state.devices.entry(device_id.to_string()).or_default().objects.push(StoredObject {
            storage,
            handle,
            name: name.to_string(),
            parent,
            is_folder: false,
            data: data.to_vec(),
        });
        handle
    }

    /// Names of all objects on the device, in enumeration order.
    pub fn object_names(&self, device_id: &str) -> Vec<String> {
        lock(&self.state)
            .devices
            .get(device_id)
            .map(|d| d.objects.iter().map(|o| o.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn fail_channel_open(&self, device_id: &str, fail: bool) {
        self.configure(device_id, |d| d.fail_channel_open = fail);
    }

    pub fn fail_session_open(&self, device_id: &str, fail: bool) {
        self.configure(device_id, |d| d.fail_session_open = fail);
    }

    pub fn fail_storage_enumeration(&self, device_id: &str, fail: bool) {
        self.configure(device_id, |d| d.fail_storage_enumeration = fail);
    }

    pub fn reject_writes(&self, device_id: &str, reject: bool) {
        self.configure(device_id, |d| d.reject_writes = reject);
    }

    /// Channel opens on the device never complete.
    pub fn hang_channel_open(&self, device_id: &str, hang: bool) {
        self.configure(device_id, |d| d.hang_channel_open = hang);
    }

    /// Object operations on the device never complete.
    pub fn hang_transfers(&self, device_id: &str, hang: bool) {
        self.configure(device_id, |d| d.hang_transfers = hang);
    }

    /// CloseSession on the device never completes.
    pub fn hang_close(&self, device_id: &str, hang: bool) {
        self.configure(device_id, |d| d.hang_close = hang);
    }

    pub fn channels_opened(&self) -> usize {
        lock(&self.state).channels_opened
    }

    pub fn sessions_opened(&self) -> usize {
        lock(&self.state).sessions_opened
    }

    /// Number of times a channel was released (session closed or dropped, or channel dropped
    /// during a failed session open).
    pub fn releases(&self) -> usize {
        lock(&self.state).releases
    }

    fn configure(&self, device_id: &str, apply: impl FnOnce(&mut DeviceState)) {
        let mut state = lock(&self.state);
        apply(state.devices.entry(device_id.to_string()).or_default());
    }
}

/// Waits forever if `switch` is set on the device. The guard is released before waiting.
async fn stall_if(state: &Mutex<BackendState>, device_id: &str, switch: impl Fn(&DeviceState) -> bool) {
    let hung = lock(state).devices.get(device_id).is_some_and(switch);
    if hung {
        debug!("InMemoryBackend: {} is not responding", device_id);
        std::future::pending::<()>().await;
    }
}

/// Channel to a simulated device.
#[derive(Debug)]
pub struct InMemoryChannel {
    device_id: String,
}

/// Session on a simulated device.
#[derive(Debug)]
pub struct InMemorySession {
    state: Arc<Mutex<BackendState>>,
    device_id: String,
    released: bool,
}

impl InMemorySession {
    async fn stall_if_transfers_hang(&self) {
        stall_if(&self.state, &self.device_id, |d| d.hang_transfers).await;
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            lock(&self.state).releases += 1;
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

impl DeviceBackend for InMemoryBackend {
    type Channel = InMemoryChannel;
    type Session = InMemorySession;

    async fn open_channel(&self, device: &DeviceHandle) -> Result<InMemoryChannel, BackendError> {
        stall_if(&self.state, &device.id, |d| d.hang_channel_open).await;
        let mut state = lock(&self.state);
        let entry = match state.devices.get(&device.id) {
            Some(entry) if entry.present => entry,
            _ => return Err(BackendError::NoDevice),
        };
        if entry.fail_channel_open {
            return Err(BackendError::ExclusiveAccess(None));
        }
        state.channels_opened += 1;
        debug!("InMemoryBackend: channel opened for {}", device.id);
        Ok(InMemoryChannel {
            device_id: device.id.clone(),
        })
    }

    async fn open_session(&self, channel: InMemoryChannel) -> Result<InMemorySession, BackendError> {
        let mut state = lock(&self.state);
        let outcome = state.device(&channel.device_id).map(|d| d.fail_session_open);
        match outcome {
            Ok(false) => {}
            Ok(true) => {
                // The channel is dropped here, which releases it
                state.releases += 1;
                return Err(BackendError::Io("OpenSession failed".to_string()));
            }
            Err(e) => {
                state.releases += 1;
                return Err(e);
            }
        }
        state.sessions_opened += 1;
        debug!("InMemoryBackend: session opened for {}", channel.device_id);
        Ok(InMemorySession {
            state: Arc::clone(&self.state),
            device_id: channel.device_id,
            released: false,
        })
    }
}

impl ProtocolSession for InMemorySession {
    fn device_info(&self) -> DeviceInfo {
        lock(&self.state)
            .devices
            .get(&self.device_id)
            .map(|d| d.info.clone())
            .unwrap_or_default()
    }

    async fn storage_units(&mut self) -> Result<Vec<StorageUnit>, BackendError> {
        let mut state = lock(&self.state);
        let device = state.device(&self.device_id)?;
        if device.fail_storage_enumeration {
            return Err(BackendError::Io("GetStorageIDs failed".to_string()));
        }
        Ok(device.storages.clone())
    }

    async fn list_objects(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
    ) -> Result<Vec<TransferObject>, BackendError> {
        self.stall_if_transfers_hang().await;
        let mut state = lock(&self.state);
        let device = state.device(&self.device_id)?;
        Ok(device
            .objects
            .iter()
            .filter(|o| o.storage == storage && o.parent == parent)
            .map(StoredObject::to_transfer_object)
            .collect())
    }

    async fn object_info(&mut self, storage: StorageId, handle: ObjectHandle) -> Result<TransferObject, BackendError> {
        self.stall_if_transfers_hang().await;
        let mut state = lock(&self.state);
        let device = state.device(&self.device_id)?;
        device
            .objects
            .iter()
            .find(|o| o.storage == storage && o.handle == handle)
            .map(StoredObject::to_transfer_object)
            .ok_or(BackendError::InvalidHandle)
    }

    async fn read_object(&mut self, storage: StorageId, handle: ObjectHandle) -> Result<Vec<u8>, BackendError> {
        self.stall_if_transfers_hang().await;
        let mut state = lock(&self.state);
        let device = state.device(&self.device_id)?;
        device
            .objects
            .iter()
            .find(|o| o.storage == storage && o.handle == handle && !o.is_folder)
            .map(|o| o.data.clone())
            .ok_or(BackendError::InvalidHandle)
    }

    async fn send_object(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
        data: Vec<u8>,
    ) -> Result<ObjectHandle, BackendError> {
        self.stall_if_transfers_hang().await;
        let mut state = lock(&self.state);
        let handle = state.allocate_handle();
        let device = state.device(&self.device_id)?;
        if device.reject_writes {
            return Err(BackendError::Rejected("StoreReadOnly".to_string()));
        }
        if !device.storages.iter().any(|s| s.id == storage) {
            return Err(BackendError::Rejected("InvalidStorageID".to_string()));
        }
        device.objects.push(StoredObject {
            storage,
            handle,
            name: name.to_string(),
            parent,
            is_folder: false,
            data,
        });
        Ok(handle)
    }

    async fn create_folder(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<ObjectHandle, BackendError> {
        self.stall_if_transfers_hang().await;
        let mut state = lock(&self.state);
        let handle = state.allocate_handle();
        let device = state.device(&self.device_id)?;
        if device.reject_writes {
            return Err(BackendError::Rejected("StoreReadOnly".to_string()));
        }
        device.objects.push(StoredObject {
            storage,
            handle,
            name: name.to_string(),
            parent,
            is_folder: true,
            data: Vec::new(),
        });
        Ok(handle)
    }

    async fn delete_object(&mut self, storage: StorageId, handle: ObjectHandle) -> Result<(), BackendError> {
        self.stall_if_transfers_hang().await;
        let mut state = lock(&self.state);
        let device = state.device(&self.device_id)?;
        let before = device.objects.len();
        device
            .objects
            .retain(|o| !(o.storage == storage && (o.handle == handle || o.parent == Some(handle))));
        if device.objects.len() == before {
            return Err(BackendError::InvalidHandle);
        }
        Ok(())
    }

    async fn close(mut self) -> Result<(), BackendError> {
        stall_if(&self.state, &self.device_id, |d| d.hang_close).await;
        self.release();
        debug!("InMemoryBackend: session closed for {}", self.device_id);
        Ok(())
    }
}
