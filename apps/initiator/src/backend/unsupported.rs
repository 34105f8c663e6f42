//! Backend for platforms without MTP support.
//!
//! MTP is only wired up on macOS and Linux. This stub lets the crate build
//! and run elsewhere; every open attempt fails with `Unsupported`.

use super::{BackendError, DeviceBackend, ProtocolSession};
use crate::device::{DeviceHandle, DeviceInfo, ObjectHandle, StorageId, StorageUnit, TransferObject};

#[derive(Debug, Clone, Default)]
pub struct UnsupportedBackend;

/// Never constructed.
#[derive(Debug)]
pub enum NoChannel {}

/// Never constructed.
#[derive(Debug)]
pub enum NoSession {}

fn unsupported() -> BackendError {
    BackendError::Unsupported(format!("MTP is not supported on {}", std::env::consts::OS))
}

impl DeviceBackend for UnsupportedBackend {
    type Channel = NoChannel;
    type Session = NoSession;

    async fn open_channel(&self, _device: &DeviceHandle) -> Result<NoChannel, BackendError> {
        Err(unsupported())
    }

    async fn open_session(&self, channel: NoChannel) -> Result<NoSession, BackendError> {
        match channel {}
    }
}

impl ProtocolSession for NoSession {
    fn device_info(&self) -> DeviceInfo {
        match *self {}
    }

    async fn storage_units(&mut self) -> Result<Vec<StorageUnit>, BackendError> {
        match *self {}
    }

    async fn list_objects(
        &mut self,
        _storage: StorageId,
        _parent: Option<ObjectHandle>,
    ) -> Result<Vec<TransferObject>, BackendError> {
        match *self {}
    }

    async fn object_info(
        &mut self,
        _storage: StorageId,
        _handle: ObjectHandle,
    ) -> Result<TransferObject, BackendError> {
        match *self {}
    }

    async fn read_object(&mut self, _storage: StorageId, _handle: ObjectHandle) -> Result<Vec<u8>, BackendError> {
        match *self {}
    }

    async fn send_object(
        &mut self,
        _storage: StorageId,
        _parent: Option<ObjectHandle>,
        _name: &str,
        _data: Vec<u8>,
    ) -> Result<ObjectHandle, BackendError> {
        match *self {}
    }

    async fn create_folder(
        &mut self,
        _storage: StorageId,
        _parent: Option<ObjectHandle>,
        _name: &str,
    ) -> Result<ObjectHandle, BackendError> {
        match *self {}
    }

    async fn delete_object(&mut self, _storage: StorageId, _handle: ObjectHandle) -> Result<(), BackendError> {
        match *self {}
    }

    async fn close(self) -> Result<(), BackendError> {
        match self {}
    }
}
