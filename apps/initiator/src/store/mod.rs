//! Object-store facade over an open session.
//!
//! Thin wrapper over the backend's enumerate/read/write primitives. No
//! caching: every call is a round trip to the device. Calls on one session
//! are serialized by a per-session lock, and every backend call is bounded
//! by the transfer timeout.
//!
//! The protocol session sits in an `Option` inside that lock. Closing the
//! session is a `take()`, so the channel is released exactly once whether
//! the close comes from the manager (detach, close request) or from a
//! transfer that found the device gone.

mod listing;

pub use listing::ObjectListing;

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use crate::backend::{BackendError, ProtocolSession};
use crate::device::{ObjectHandle, ObjectRef, StorageId, StorageUnit, TransferObject};
use crate::session::{EventFeed, EventSink, SessionError, SessionEvent, TransferDirection};

/// State shared between the manager and every `ObjectStore` for one open session.
pub(crate) struct SessionShared<S: ProtocolSession> {
    device_id: String,
    session: Mutex<Option<S>>,
    storages: Vec<StorageUnit>,
    transfer_timeout: Duration,
    feed: EventFeed,
    sink: Arc<dyn EventSink>,
}

impl<S: ProtocolSession> SessionShared<S> {
    pub(crate) fn new(
        device_id: &str,
        session: S,
        storages: Vec<StorageUnit>,
        transfer_timeout: Duration,
        feed: EventFeed,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            session: Mutex::new(Some(session)),
            storages,
            transfer_timeout,
            feed,
            sink,
        }
    }

    pub(crate) fn storages(&self) -> &[StorageUnit] {
        &self.storages
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Closes the session if it is still held. Returns true if this call released it.
    ///
    /// Waits for an in-flight transfer to finish; transfers are bounded by the
    /// transfer timeout, so this wait is too.
    pub(crate) async fn release(&self) -> bool {
        let taken = self.session.lock().await.take();
        let Some(session) = taken else {
            debug!("release: session on {} already released", self.device_id);
            return false;
        };

        match tokio::time::timeout(self.transfer_timeout, session.close()).await {
            Ok(Ok(())) => debug!("release: session on {} closed", self.device_id),
            Ok(Err(e)) => warn!("release: closing session on {} failed: {}", self.device_id, e),
            Err(_) => warn!("release: closing session on {} timed out", self.device_id),
        }
        true
    }

    /// Acquires the session lock with a timeout.
    /// This prevents indefinite blocking if the device is unresponsive or another operation is stuck.
    async fn acquire(&self, operation: &str) -> Result<MutexGuard<'_, Option<S>>, SessionError> {
        tokio::time::timeout(self.transfer_timeout, self.session.lock())
            .await
            .map_err(|_| {
                error!("{}: timed out waiting for session lock on {}", operation, self.device_id);
                SessionError::Timeout {
                    device_id: self.device_id.clone(),
                }
            })
    }

    /// Runs one backend call under the transfer timeout.
    async fn bounded<T>(&self, call: impl Future<Output = Result<T, BackendError>>) -> Result<T, BackendError> {
        tokio::time::timeout(self.transfer_timeout, call)
            .await
            .unwrap_or(Err(BackendError::Timeout))
    }

    /// Drops the session if the error says the channel is gone, and tells the manager.
    fn check_channel(&self, guard: &mut Option<S>, e: &BackendError) {
        if !e.is_disconnect() {
            return;
        }
        if let Some(session) = guard.take() {
            warn!("Channel to {} lost during transfer, releasing session", self.device_id);
            // The device is gone, so there is nobody to send CloseSession to
            drop(session);
            self.feed.channel_lost(&self.device_id);
        }
    }

    fn not_open(&self) -> SessionError {
        SessionError::NotOpen {
            device_id: self.device_id.clone(),
        }
    }

    /// Maps errors from enumeration and bookkeeping calls.
    fn map_error(&self, e: BackendError, handle: Option<ObjectHandle>) -> SessionError {
        let device_id = self.device_id.clone();
        match e {
            BackendError::NoDevice | BackendError::Disconnected => SessionError::Disconnected { device_id },
            BackendError::Timeout => SessionError::Timeout { device_id },
            BackendError::InvalidHandle => SessionError::ObjectNotFound {
                device_id,
                handle: handle.map(|h| h.0).unwrap_or(0),
            },
            BackendError::Unsupported(message) => SessionError::UnsupportedPlatform { message },
            other => SessionError::ProtocolIo {
                device_id,
                message: other.to_string(),
            },
        }
    }

    /// Maps errors from object writes.
    fn map_write_error(&self, e: BackendError) -> SessionError {
        match e {
            BackendError::Rejected(_) | BackendError::InvalidHandle | BackendError::Io(_) => {
                SessionError::WriteRejected {
                    device_id: self.device_id.clone(),
                    reason: e.to_string(),
                }
            }
            other => self.map_error(other, None),
        }
    }

    fn emit_transfer(
        &self,
        operation_id: &str,
        direction: TransferDirection,
        result: Result<u64, &SessionError>,
    ) {
        let event = match result {
            Ok(bytes) => SessionEvent::TransferCompleted {
                device_id: self.device_id.clone(),
                operation_id: operation_id.to_string(),
                direction,
                bytes,
            },
            Err(e) => SessionEvent::TransferFailed {
                device_id: self.device_id.clone(),
                operation_id: operation_id.to_string(),
                direction,
                reason: e.to_string(),
            },
        };
        self.sink.emit(event);
    }
}

/// List/read/write access to an open session's storage units.
///
/// Cheap to clone. Outlives the session safely: once the session closes every
/// call fails (`NotOpen`, or `ObjectNotFound` for reads).
pub struct ObjectStore<S: ProtocolSession> {
    shared: Arc<SessionShared<S>>,
}

impl<S: ProtocolSession> Clone for ObjectStore<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ProtocolSession> ObjectStore<S> {
    pub(crate) fn new(shared: Arc<SessionShared<S>>) -> Self {
        Self { shared }
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Storage units enumerated when the session opened.
    pub fn storages(&self) -> &[StorageUnit] {
        self.shared.storages()
    }

    /// The first enumerated storage unit.
    pub fn default_storage(&self) -> Result<&StorageUnit, SessionError> {
        self.shared.storages().first().ok_or_else(|| SessionError::NoStorage {
            device_id: self.shared.device_id.clone(),
        })
    }

    pub async fn is_open(&self) -> bool {
        self.shared.is_open().await
    }

    /// Lists root-level objects, keeping those whose name starts with `name_filter`
    /// (case-insensitive). Order is the device's.
    pub fn list_objects(&self, storage: StorageId, name_filter: Option<&str>) -> ObjectListing<S> {
        ObjectListing::new(Arc::clone(&self.shared), storage, None, name_filter)
    }

    /// Lists the children of a folder.
    pub fn list_children(
        &self,
        storage: StorageId,
        parent: ObjectHandle,
        name_filter: Option<&str>,
    ) -> ObjectListing<S> {
        ObjectListing::new(Arc::clone(&self.shared), storage, Some(parent), name_filter)
    }

    /// Fetches one object's metadata.
    pub async fn object_info(&self, object: ObjectRef) -> Result<TransferObject, SessionError> {
        let shared = &self.shared;
        let mut guard = shared.acquire("object_info").await?;
        let Some(session) = guard.as_mut() else {
            return Err(SessionError::ObjectNotFound {
                device_id: shared.device_id.clone(),
                handle: object.handle.0,
            });
        };
        match shared.bounded(session.object_info(object.storage, object.handle)).await {
            Ok(info) => Ok(info),
            Err(e) => {
                shared.check_channel(&mut guard, &e);
                Err(shared.map_error(e, Some(object.handle)))
            }
        }
    }

    /// Reads an object's bytes. Decoding is the caller's business.
    pub async fn read_object(&self, object: ObjectRef) -> Result<Vec<u8>, SessionError> {
        let shared = &self.shared;
        let operation_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "read_object [{}]: device={}, storage={}, handle={}",
            operation_id, shared.device_id, object.storage.0, object.handle.0
        );

        let result = async {
            let mut guard = shared.acquire("read_object").await?;
            let Some(session) = guard.as_mut() else {
                // A closed session makes every handle stale
                return Err(SessionError::ObjectNotFound {
                    device_id: shared.device_id.clone(),
                    handle: object.handle.0,
                });
            };
            match shared.bounded(session.read_object(object.storage, object.handle)).await {
                Ok(data) => Ok(data),
                Err(e) => {
                    shared.check_channel(&mut guard, &e);
                    Err(shared.map_error(e, Some(object.handle)))
                }
            }
        }
        .await;

        match &result {
            Ok(data) => {
                info!("read_object [{}]: {} bytes from {}", operation_id, data.len(), shared.device_id);
                shared.emit_transfer(&operation_id, TransferDirection::Read, Ok(data.len() as u64));
            }
            Err(e) => shared.emit_transfer(&operation_id, TransferDirection::Read, Err(e)),
        }
        result
    }

    /// Writes a new object. No retry on failure.
    pub async fn write_object(
        &self,
        storage: StorageId,
        name: &str,
        data: &[u8],
        parent: Option<ObjectHandle>,
    ) -> Result<ObjectRef, SessionError> {
        let shared = &self.shared;
        let operation_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "write_object [{}]: device={}, storage={}, name={}, bytes={}",
            operation_id,
            shared.device_id,
            storage.0,
            name,
            data.len()
        );

        let result = async {
            let mut guard = shared.acquire("write_object").await?;
            let Some(session) = guard.as_mut() else {
                return Err(shared.not_open());
            };
            match shared
                .bounded(session.send_object(storage, parent, name, data.to_vec()))
                .await
            {
                Ok(handle) => Ok(ObjectRef { storage, handle }),
                Err(e) => {
                    shared.check_channel(&mut guard, &e);
                    Err(shared.map_write_error(e))
                }
            }
        }
        .await;

        match &result {
            Ok(object) => {
                info!(
                    "write_object [{}]: {} ({} bytes) -> handle {}",
                    operation_id,
                    name,
                    data.len(),
                    object.handle.0
                );
                shared.emit_transfer(&operation_id, TransferDirection::Write, Ok(data.len() as u64));
            }
            Err(e) => shared.emit_transfer(&operation_id, TransferDirection::Write, Err(e)),
        }
        result
    }

    /// Deletes an object. Folders go with their contents.
    pub async fn delete_object(&self, object: ObjectRef) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut guard = shared.acquire("delete_object").await?;
        let Some(session) = guard.as_mut() else {
            return Err(shared.not_open());
        };
        match shared.bounded(session.delete_object(object.storage, object.handle)).await {
            Ok(()) => {
                debug!("delete_object: removed handle {} on {}", object.handle.0, shared.device_id);
                Ok(())
            }
            Err(e) => {
                shared.check_channel(&mut guard, &e);
                Err(shared.map_error(e, Some(object.handle)))
            }
        }
    }

    /// Creates a folder ("association" in MTP terms).
    pub async fn create_folder(
        &self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<ObjectRef, SessionError> {
        let shared = &self.shared;
        let mut guard = shared.acquire("create_folder").await?;
        let Some(session) = guard.as_mut() else {
            return Err(shared.not_open());
        };
        match shared.bounded(session.create_folder(storage, parent, name)).await {
            Ok(handle) => {
                info!("create_folder: {} -> handle {} on {}", name, handle.0, shared.device_id);
                Ok(ObjectRef { storage, handle })
            }
            Err(e) => {
                shared.check_channel(&mut guard, &e);
                Err(shared.map_write_error(e))
            }
        }
    }

    /// Finds a root-level object by exact name, ignoring case.
    pub async fn find_in_root(&self, storage: StorageId, name: &str) -> Result<Option<ObjectRef>, SessionError> {
        self.find_child(storage, None, name).await
    }

    /// Finds `name` inside the root-level folder `folder`.
    pub async fn find_in_top_level_folder(
        &self,
        storage: StorageId,
        folder: &str,
        name: &str,
    ) -> Result<Option<ObjectRef>, SessionError> {
        let folders = self.top_level_folders(storage).await?;
        match folders.get(folder) {
            Some(&handle) => self.find_child(storage, Some(handle), name).await,
            None => Ok(None),
        }
    }

    /// Root-level folders by name.
    pub async fn top_level_folders(&self, storage: StorageId) -> Result<BTreeMap<String, ObjectHandle>, SessionError> {
        let objects = self.list_objects(storage, None).collect().await?;
        debug!("top_level_folders: {} root objects on {}", objects.len(), self.device_id());
        Ok(objects
            .into_iter()
            .filter(|o| o.is_folder)
            .map(|o| (o.name, o.handle))
            .collect())
    }

    /// Deletes a root-level object with this name, if there is one.
    pub async fn delete_if_exists_in_root(&self, storage: StorageId, name: &str) -> Result<bool, SessionError> {
        match self.find_in_root(storage, name).await? {
            Some(object) => {
                debug!("Deleting {} at handle {}", name, object.handle.0);
                self.delete_object(object).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes a file, first removing a root-level file of the same name when `replace_existing`.
    pub async fn create_file(
        &self,
        storage: StorageId,
        name: &str,
        data: &[u8],
        parent: Option<ObjectHandle>,
        replace_existing: bool,
    ) -> Result<ObjectRef, SessionError> {
        if replace_existing {
            self.delete_if_exists_in_root(storage, name).await?;
        }
        self.write_object(storage, name, data, parent).await
    }

    async fn find_child(
        &self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<Option<ObjectRef>, SessionError> {
        let mut listing = ObjectListing::new(Arc::clone(&self.shared), storage, parent, None);
        while let Some(object) = listing.next().await {
            let object = object?;
            if object.name.to_lowercase() == name.to_lowercase() {
                return Ok(Some(object.object_ref()));
            }
        }
        Ok(None)
    }
}
