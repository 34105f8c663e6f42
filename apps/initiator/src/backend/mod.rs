//! Device backend seam.
//!
//! The session core never talks USB or MTP wire format itself. It asks a
//! `DeviceBackend` to open a channel to an attached device, then to open a
//! protocol session over that channel, and drives all object operations
//! through the resulting `ProtocolSession`.
//!
//! Implementations:
//! - `MtpRsBackend`: real devices via mtp-rs (macOS and Linux)
//! - `UnsupportedBackend`: everything else, fails with `UnsupportedPlatform`
//! - `InMemoryBackend`: scripted devices for tests and dry runs

mod in_memory;
#[cfg(any(target_os = "macos", target_os = "linux"))]
mod mtp;
#[cfg(not(any(target_os = "macos", target_os = "linux")))]
mod unsupported;

pub use in_memory::{InMemoryBackend, InMemoryChannel, InMemoryDevice, InMemorySession};
#[cfg(any(target_os = "macos", target_os = "linux"))]
pub use mtp::{MtpRsBackend, MtpRsChannel, MtpRsSession};
#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub use unsupported::UnsupportedBackend;

use std::future::Future;

use crate::device::{DeviceHandle, DeviceInfo, ObjectHandle, StorageId, StorageUnit, TransferObject};

/// Errors reported by a backend, before the session core attaches device context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The device is not (or no longer) enumerated.
    NoDevice,
    /// The device went away during an operation.
    Disconnected,
    /// The device did not answer in time.
    Timeout,
    /// Another process holds the USB interface.
    ExclusiveAccess(Option<String>),
    /// Handle does not name an object (deleted, or from another session).
    InvalidHandle,
    /// The device refused the operation (read-only store, store full, access denied...).
    Rejected(String),
    /// Transport or decoding failure.
    Io(String),
    /// This build has no way to reach MTP devices.
    Unsupported(String),
}

impl BackendError {
    /// Whether the error means the channel itself is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NoDevice | Self::Disconnected)
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevice => write!(f, "device not found"),
            Self::Disconnected => write!(f, "device disconnected"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::ExclusiveAccess(Some(owner)) => write!(f, "device is in use by {owner}"),
            Self::ExclusiveAccess(None) => write!(f, "device is in use by another process"),
            Self::InvalidHandle => write!(f, "invalid object handle"),
            Self::Rejected(reason) => write!(f, "rejected by device: {reason}"),
            Self::Io(message) => write!(f, "I/O error: {message}"),
            Self::Unsupported(message) => write!(f, "unsupported: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Opens channels and protocol sessions to attached devices.
pub trait DeviceBackend: Send + Sync + 'static {
    /// Low-level endpoint to one device, prerequisite to a protocol session.
    type Channel: Send + 'static;
    /// An open protocol session. Dropping it without `close` still releases the device.
    type Session: ProtocolSession;

    fn open_channel(&self, device: &DeviceHandle) -> impl Future<Output = Result<Self::Channel, BackendError>> + Send;

    /// Consumes the channel; on failure the channel is released.
    fn open_session(&self, channel: Self::Channel)
    -> impl Future<Output = Result<Self::Session, BackendError>> + Send;
}

/// Object primitives over an open protocol session.
///
/// `parent: None` means the storage root.
pub trait ProtocolSession: Send + 'static {
    /// Identity strings from the device's DeviceInfo dataset.
    fn device_info(&self) -> DeviceInfo;

    fn storage_units(&mut self) -> impl Future<Output = Result<Vec<StorageUnit>, BackendError>> + Send;

    fn list_objects(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
    ) -> impl Future<Output = Result<Vec<TransferObject>, BackendError>> + Send;

    fn object_info(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
    ) -> impl Future<Output = Result<TransferObject, BackendError>> + Send;

    fn read_object(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
    ) -> impl Future<Output = Result<Vec<u8>, BackendError>> + Send;

    fn send_object(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<ObjectHandle, BackendError>> + Send;

    fn create_folder(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> impl Future<Output = Result<ObjectHandle, BackendError>> + Send;

    fn delete_object(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Closes the session and releases the channel.
    fn close(self) -> impl Future<Output = Result<(), BackendError>> + Send;
}
