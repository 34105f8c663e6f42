//! Session lifecycle: attach → permission → open → transfer → close/detach.
//!
//! The manager owns everything about the current device: its handle, its
//! permission record (through `PermissionGate`), and the open session. It
//! processes device events one at a time, so no transition ever races
//! another. Only one device is handled at a time; attaches of other devices
//! are ignored while one is held.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::errors::SessionError;
use super::events::{DetachReason, DeviceEvent, EventFeed, EventQueue, EventSink, OpenStage, SessionEvent};
use super::permission::{PermissionGate, PermissionPrompt, PermissionState};
use super::state::SessionState;
use crate::backend::{BackendError, DeviceBackend, ProtocolSession};
use crate::device::{DeviceHandle, DeviceInfo, StorageUnit};
use crate::store::{ObjectStore, SessionShared};

/// Default timeout for opening a session (seconds).
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 30;

/// Default timeout for a single transfer call (seconds). Transfers get 10x the open timeout.
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = DEFAULT_OPEN_TIMEOUT_SECS * 10;

/// Tunables for `SessionManager`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Request permission as soon as a device attaches.
    pub auto_request_permission: bool,
    /// Open the session as soon as permission is granted.
    pub auto_open: bool,
    pub open_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            auto_request_permission: true,
            auto_open: true,
            open_timeout: Duration::from_secs(DEFAULT_OPEN_TIMEOUT_SECS),
            transfer_timeout: Duration::from_secs(DEFAULT_TRANSFER_TIMEOUT_SECS),
        }
    }
}

/// Shared view of the currently open store, for tasks outside the manager.
///
/// Holds `Some` exactly while the manager is `Open`.
pub struct SessionSlot<S: ProtocolSession> {
    inner: Arc<Mutex<Option<ObjectStore<S>>>>,
}

impl<S: ProtocolSession> Clone for SessionSlot<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ProtocolSession> SessionSlot<S> {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// The open store, if any.
    pub fn current(&self) -> Option<ObjectStore<S>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, store: Option<ObjectStore<S>>) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = store;
    }
}

/// Drives one device through its session lifecycle.
pub struct SessionManager<B: DeviceBackend> {
    backend: B,
    gate: PermissionGate,
    sink: Arc<dyn EventSink>,
    feed: EventFeed,
    options: ManagerOptions,
    state: SessionState,
    device: Option<DeviceHandle>,
    session: Option<Arc<SessionShared<B::Session>>>,
    slot: SessionSlot<B::Session>,
}

impl<B: DeviceBackend> SessionManager<B> {
    /// `feed` must feed the queue later passed to `run`; the manager queues
    /// its own follow-up events (automatic open) on it.
    pub fn new(backend: B, prompt: Arc<dyn PermissionPrompt>, sink: Arc<dyn EventSink>, feed: EventFeed) -> Self {
        Self {
            backend,
            gate: PermissionGate::new(prompt, Arc::clone(&sink)),
            sink,
            feed,
            options: ManagerOptions::default(),
            state: SessionState::Detached,
            device: None,
            session: None,
            slot: SessionSlot::new(),
        }
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    /// Permission record of the current device.
    pub fn permission_state(&self) -> PermissionState {
        match &self.device {
            Some(device) => self.gate.state(&device.id),
            None => PermissionState::Unrequested,
        }
    }

    pub fn slot(&self) -> SessionSlot<B::Session> {
        self.slot.clone()
    }

    /// The open store. Fails unless `Open`.
    pub fn object_store(&self) -> Result<ObjectStore<B::Session>, SessionError> {
        let device_id = self.require_device()?.id.clone();
        match (&self.session, self.state.accepts_transfers()) {
            (Some(shared), true) => Ok(ObjectStore::new(Arc::clone(shared))),
            _ => Err(SessionError::NotOpen { device_id }),
        }
    }

    /// Processes events until the queue ends.
    pub async fn run(&mut self, queue: &mut EventQueue) {
        info!("Session manager started");
        while let Some(event) = queue.next().await {
            self.handle_event(event).await;
        }
        info!("Device event queue closed");
    }

    /// Releases any held session. The manager ends `Detached`.
    pub async fn shutdown(&mut self) {
        if let Some(device) = self.device.clone() {
            info!("Shutting down, releasing {}", device.id);
            self.detach(&device.id, DetachReason::Unplugged).await;
        }
    }

    pub async fn handle_event(&mut self, event: DeviceEvent) {
        debug!("handle_event: {:?} (state={:?})", event, self.state);
        match event {
            DeviceEvent::DeviceAttached(device) => self.on_attached(device),
            DeviceEvent::DeviceDetached(device_id) => {
                if self.is_current(&device_id) {
                    self.detach(&device_id, DetachReason::Unplugged).await;
                } else {
                    debug!("Ignoring detach of untracked device {}", device_id);
                }
            }
            DeviceEvent::PermissionResult { device_id, granted } => self.on_permission_result(&device_id, granted),
            DeviceEvent::OpenRequested(device_id) => {
                if !self.is_current(&device_id) {
                    debug!("Ignoring open request for untracked device {}", device_id);
                    return;
                }
                if let Err(e) = self.open_session().await {
                    debug!("Open request for {} failed: {}", device_id, e);
                }
            }
            DeviceEvent::CloseRequested(device_id) => {
                if !self.is_current(&device_id) {
                    debug!("Ignoring close request for untracked device {}", device_id);
                    return;
                }
                if let Err(e) = self.close_session().await {
                    debug!("Close request for {} failed: {}", device_id, e);
                }
            }
            DeviceEvent::ChannelLost(device_id) => {
                if self.is_current(&device_id) && matches!(self.state, SessionState::Open | SessionState::Closed) {
                    warn!("Channel to {} lost, detaching", device_id);
                    self.detach(&device_id, DetachReason::ChannelLost).await;
                } else {
                    debug!("Ignoring channel loss for {} (state={:?})", device_id, self.state);
                }
            }
        }
    }

    /// Asks for transfer permission for the current device.
    ///
    /// Only does something from `Attached`; already pending or granted
    /// devices are left alone. This is also the way to ask again after a
    /// denial.
    pub fn request_permission(&mut self) -> Result<(), SessionError> {
        let device = self.require_device()?.clone();
        if self.state != SessionState::Attached {
            debug!("request_permission: {} is {:?}, nothing to do", device.id, self.state);
            return Ok(());
        }
        self.gate.request_permission(&device);
        if self.gate.state(&device.id) == PermissionState::Pending {
            self.state = SessionState::PermissionPending;
        }
        Ok(())
    }

    /// Opens the protocol session and enumerates storage units.
    ///
    /// On failure the manager stays `Authorized` and a `SessionOpenFailed`
    /// event names the stage that failed. Already open: returns the
    /// existing storage units.
    pub async fn open_session(&mut self) -> Result<Vec<StorageUnit>, SessionError> {
        let device = self.require_device()?.clone();

        match self.state {
            SessionState::Open => {
                if let Some(shared) = &self.session {
                    debug!("open_session: {} already open", device.id);
                    return Ok(shared.storages().to_vec());
                }
            }
            SessionState::Closed => {
                warn!("open_session: session on {} was closed, reattach to open again", device.id);
                return Err(SessionError::NotOpen { device_id: device.id });
            }
            _ => {}
        }
        if !self.state.can_open() || !self.gate.has_permission(&device.id) {
            warn!("open_session: no permission for {} (state={:?})", device.id, self.state);
            return Err(SessionError::PermissionDenied { device_id: device.id });
        }

        info!("Opening MTP session on {}", device.display_name());
        match self.open_stages(&device).await {
            Ok((shared, device_info)) => {
                let storages = shared.storages().to_vec();
                let shared = Arc::new(shared);
                self.slot.set(Some(ObjectStore::new(Arc::clone(&shared))));
                self.session = Some(shared);
                self.state = SessionState::Open;
                if let Some(current) = self.device.as_mut() {
                    current.apply_info(&device_info);
                }
                self.sink.emit(SessionEvent::SessionOpened {
                    device_id: device.id.clone(),
                    device_info,
                    storages: storages.clone(),
                });
                Ok(storages)
            }
            Err((stage, error)) => {
                warn!("Failed to open {} at {:?} stage: {}", device.id, stage, error);
                self.sink.emit(SessionEvent::SessionOpenFailed {
                    device_id: device.id.clone(),
                    stage,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Closes the open session. The attachment cycle ends in `Closed`.
    pub async fn close_session(&mut self) -> Result<(), SessionError> {
        let device_id = self.require_device()?.id.clone();
        if self.state != SessionState::Open {
            return Err(SessionError::NotOpen { device_id });
        }
        self.release_session().await;
        self.state = SessionState::Closed;
        self.sink.emit(SessionEvent::SessionClosed { device_id });
        Ok(())
    }

    fn on_attached(&mut self, device: DeviceHandle) {
        if let Some(current) = &self.device {
            if current.id == device.id {
                debug!("Ignoring duplicate attach of {}", device.id);
            } else {
                warn!(
                    "Ignoring attach of {}: already handling {} (one device at a time)",
                    device.id, current.id
                );
            }
            return;
        }

        info!("Device attached: {} ({})", device.display_name(), device.id);
        self.gate.track(&device.id);
        self.state = SessionState::Attached;
        self.sink.emit(SessionEvent::Attached { device: device.clone() });
        self.device = Some(device);

        if self.options.auto_request_permission
            && let Err(e) = self.request_permission()
        {
            warn!("Automatic permission request failed: {}", e);
        }
    }

    fn on_permission_result(&mut self, device_id: &str, granted: bool) {
        let Some(record) = self.gate.on_permission_result(device_id, granted) else {
            return;
        };
        if self.state != SessionState::PermissionPending {
            warn!(
                "Permission result for {} arrived in state {:?}, record updated only",
                device_id, self.state
            );
            return;
        }

        match record {
            PermissionState::Granted => {
                self.state = SessionState::Authorized;
                self.sink.emit(SessionEvent::PermissionGranted {
                    device_id: device_id.to_string(),
                });
                if self.options.auto_open {
                    self.feed.open_requested(device_id);
                }
            }
            PermissionState::Denied => {
                self.state = SessionState::Attached;
                self.sink.emit(SessionEvent::PermissionDenied {
                    device_id: device_id.to_string(),
                });
            }
            PermissionState::Unrequested | PermissionState::Pending => {}
        }
    }

    async fn open_stages(
        &self,
        device: &DeviceHandle,
    ) -> Result<(SessionShared<B::Session>, DeviceInfo), (OpenStage, SessionError)> {
        let timeout = self.options.open_timeout;

        let channel = tokio::time::timeout(timeout, self.backend.open_channel(device))
            .await
            .unwrap_or(Err(BackendError::Timeout))
            .map_err(|e| (OpenStage::Channel, SessionError::channel_open(e, &device.id)))?;
        debug!("open_session: channel to {} acquired", device.id);

        // A timed-out open drops the channel with the future, which releases it
        let mut session = tokio::time::timeout(timeout, self.backend.open_session(channel))
            .await
            .unwrap_or(Err(BackendError::Timeout))
            .map_err(|e| (OpenStage::Protocol, SessionError::session_open(e, &device.id)))?;
        let device_info = session.device_info();
        debug!("open_session: protocol session on {} started ({:?})", device.id, device_info);

        let storages = match tokio::time::timeout(timeout, session.storage_units())
            .await
            .unwrap_or(Err(BackendError::Timeout))
        {
            Ok(storages) => storages,
            Err(e) => {
                // Dropping a timed-out close releases the session anyway
                match tokio::time::timeout(timeout, session.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(close_err)) => debug!("open_session: closing {} after failure: {}", device.id, close_err),
                    Err(_) => warn!("open_session: closing {} after failure timed out", device.id),
                }
                return Err((OpenStage::Storage, SessionError::session_open(e, &device.id)));
            }
        };
        if storages.is_empty() {
            warn!("{} exposes no storage (device may be locked)", device.id);
        }
        for storage in &storages {
            debug!(
                "Storage {}: {} ({} of {} bytes free{})",
                storage.id.0,
                storage.description,
                storage.available_bytes,
                storage.total_bytes,
                if storage.is_read_only { ", read-only" } else { "" }
            );
        }

        let shared = SessionShared::new(
            &device.id,
            session,
            storages,
            self.options.transfer_timeout,
            self.feed.clone(),
            Arc::clone(&self.sink),
        );
        Ok((shared, device_info))
    }

    /// Ends the cycle for `device_id` from any state.
    async fn detach(&mut self, device_id: &str, reason: DetachReason) {
        self.release_session().await;
        self.gate.forget(device_id);
        self.device = None;
        self.state = SessionState::Detached;
        info!("Device {} detached ({:?})", device_id, reason);
        self.sink.emit(SessionEvent::Detached {
            device_id: device_id.to_string(),
            reason,
        });
    }

    async fn release_session(&mut self) {
        self.slot.set(None);
        if let Some(shared) = self.session.take() {
            shared.release().await;
        }
    }

    fn is_current(&self, device_id: &str) -> bool {
        self.device.as_ref().is_some_and(|d| d.id == device_id)
    }

    fn require_device(&self) -> Result<&DeviceHandle, SessionError> {
        self.device.as_ref().ok_or(SessionError::NoDevice)
    }
}
