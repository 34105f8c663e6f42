//! Backend for real devices, built on mtp-rs.
//!
//! mtp-rs opens the USB interface and the MTP session in one call, so the
//! channel step here only confirms the device is still enumerated at its USB
//! location. Everything that can fail while claiming the interface or
//! negotiating the session surfaces from `open_session`.

use log::{debug, info};
use mtp_rs::ptp::{AccessCapability, ObjectFormatCode, ObjectInfo, ResponseCode};
use mtp_rs::{MtpDevice, MtpDeviceBuilder, NewObjectInfo};
use mtp_rs::{ObjectHandle as MtpObjectHandle, StorageId as MtpStorageId};
use std::time::Duration;

use super::{BackendError, DeviceBackend, ProtocolSession};
use crate::device::{DeviceHandle, DeviceInfo, ObjectHandle, StorageId, StorageUnit, TransferObject};

/// Opens sessions on USB-attached MTP devices.
#[derive(Debug, Clone)]
pub struct MtpRsBackend {
    /// Per-request timeout handed to mtp-rs.
    timeout: Duration,
}

impl MtpRsBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// A device confirmed present at its USB location.
#[derive(Debug)]
pub struct MtpRsChannel {
    device_id: String,
    location_id: u64,
}

/// An open MTP session.
pub struct MtpRsSession {
    device: MtpDevice,
    device_id: String,
    info: DeviceInfo,
}

impl DeviceBackend for MtpRsBackend {
    type Channel = MtpRsChannel;
    type Session = MtpRsSession;

    async fn open_channel(&self, device: &DeviceHandle) -> Result<MtpRsChannel, BackendError> {
        let devices = MtpDevice::list_devices().map_err(map_mtp_error)?;
        if !devices.iter().any(|d| d.location_id == device.location_id) {
            debug!("MtpRsBackend: {} is no longer enumerated", device.id);
            return Err(BackendError::NoDevice);
        }
        Ok(MtpRsChannel {
            device_id: device.id.clone(),
            location_id: device.location_id,
        })
    }

    async fn open_session(&self, channel: MtpRsChannel) -> Result<MtpRsSession, BackendError> {
        debug!(
            "MtpRsBackend: opening session on {} (timeout={:?})",
            channel.device_id, self.timeout
        );
        let device = MtpDeviceBuilder::new()
            .timeout(self.timeout)
            .open_by_location(channel.location_id)
            .await
            .map_err(|e| {
                if e.is_exclusive_access() {
                    BackendError::ExclusiveAccess(None)
                } else {
                    map_mtp_error(e)
                }
            })?;

        let mtp_info = device.device_info();
        info!(
            "MTP session open on {}: {} {}",
            channel.device_id, mtp_info.manufacturer, mtp_info.model
        );
        let info = DeviceInfo::from_descriptors(&mtp_info.manufacturer, &mtp_info.model, &mtp_info.serial_number);

        Ok(MtpRsSession {
            device,
            device_id: channel.device_id,
            info,
        })
    }
}

impl MtpRsSession {
    async fn storage(&self, storage: StorageId) -> Result<mtp_rs::Storage, BackendError> {
        self.device
            .storage(MtpStorageId(storage.0))
            .await
            .map_err(map_mtp_error)
    }
}

fn to_mtp_parent(parent: Option<ObjectHandle>) -> Option<MtpObjectHandle> {
    parent.map(|h| MtpObjectHandle(h.0))
}

/// The device's parent handle, with the storage root as `None`.
fn from_mtp_parent(parent: MtpObjectHandle) -> Option<ObjectHandle> {
    if parent == MtpObjectHandle::ROOT {
        None
    } else {
        Some(ObjectHandle(parent.0))
    }
}

fn to_transfer_object(storage: StorageId, parent: Option<ObjectHandle>, info: &ObjectInfo) -> TransferObject {
    let is_folder = info.format == ObjectFormatCode::Association;
    TransferObject {
        storage,
        handle: ObjectHandle(info.handle.0),
        name: info.filename.clone(),
        size: if is_folder { 0 } else { info.size },
        is_folder,
        parent,
    }
}

impl ProtocolSession for MtpRsSession {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn storage_units(&mut self) -> Result<Vec<StorageUnit>, BackendError> {
        let storage_list = self.device.storages().await.map_err(map_mtp_error)?;
        debug!("{}: got {} storage(s)", self.device_id, storage_list.len());

        Ok(storage_list
            .iter()
            .map(|storage| {
                let info = storage.info();
                StorageUnit {
                    id: StorageId(storage.id().0),
                    description: info.description.clone(),
                    total_bytes: info.max_capacity,
                    available_bytes: info.free_space_bytes,
                    is_read_only: !matches!(info.access_capability, AccessCapability::ReadWrite),
                }
            })
            .collect())
    }

    async fn list_objects(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
    ) -> Result<Vec<TransferObject>, BackendError> {
        let mtp_storage = self.storage(storage).await?;
        let infos = mtp_storage
            .list_objects(to_mtp_parent(parent))
            .await
            .map_err(map_mtp_error)?;
        Ok(infos.iter().map(|info| to_transfer_object(storage, parent, info)).collect())
    }

    async fn object_info(&mut self, storage: StorageId, handle: ObjectHandle) -> Result<TransferObject, BackendError> {
        let mtp_storage = self.storage(storage).await?;
        let info = mtp_storage
            .get_object_info(MtpObjectHandle(handle.0))
            .await
            .map_err(map_mtp_error)?;
        Ok(to_transfer_object(storage, from_mtp_parent(info.parent), &info))
    }

    async fn read_object(&mut self, storage: StorageId, handle: ObjectHandle) -> Result<Vec<u8>, BackendError> {
        let mtp_storage = self.storage(storage).await?;
        let mut download = mtp_storage
            .download_stream(MtpObjectHandle(handle.0))
            .await
            .map_err(map_mtp_error)?;

        // Must drain the whole stream before the storage can serve another request
        let mut data = Vec::new();
        while let Some(chunk) = download.next_chunk().await {
            let chunk = chunk.map_err(map_mtp_error)?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    async fn send_object(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
        data: Vec<u8>,
    ) -> Result<ObjectHandle, BackendError> {
        let mtp_storage = self.storage(storage).await?;
        let object_info = NewObjectInfo::file(name, data.len() as u64);

        // Using iter instead of once because iter's items are ready, making it Unpin
        let data_stream = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from(data))]);

        let handle = mtp_storage
            .upload(to_mtp_parent(parent), object_info, data_stream)
            .await
            .map_err(map_mtp_error)?;
        Ok(ObjectHandle(handle.0))
    }

    async fn create_folder(
        &mut self,
        storage: StorageId,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<ObjectHandle, BackendError> {
        let mtp_storage = self.storage(storage).await?;
        let handle = mtp_storage
            .create_folder(to_mtp_parent(parent), name)
            .await
            .map_err(map_mtp_error)?;
        Ok(ObjectHandle(handle.0))
    }

    async fn delete_object(&mut self, storage: StorageId, handle: ObjectHandle) -> Result<(), BackendError> {
        let mtp_storage = self.storage(storage).await?;
        mtp_storage
            .delete(MtpObjectHandle(handle.0))
            .await
            .map_err(map_mtp_error)
    }

    async fn close(self) -> Result<(), BackendError> {
        debug!("{}: closing MTP session", self.device_id);
        self.device.close().await.map_err(map_mtp_error)
    }
}

/// Maps mtp_rs errors to backend errors.
pub(super) fn map_mtp_error(e: mtp_rs::Error) -> BackendError {
    match e {
        mtp_rs::Error::NoDevice => BackendError::NoDevice,
        mtp_rs::Error::Disconnected => BackendError::Disconnected,
        mtp_rs::Error::Timeout => BackendError::Timeout,
        mtp_rs::Error::Cancelled => BackendError::Io("operation cancelled".to_string()),
        mtp_rs::Error::SessionNotOpen => BackendError::Io("session not open".to_string()),
        mtp_rs::Error::Protocol { code, operation } => match code {
            ResponseCode::InvalidObjectHandle | ResponseCode::InvalidParentObject => BackendError::InvalidHandle,
            ResponseCode::DeviceBusy
            | ResponseCode::StoreFull
            | ResponseCode::StoreReadOnly
            | ResponseCode::AccessDenied => BackendError::Rejected(format!("{:?}", code)),
            _ => BackendError::Io(format!("{:?} during {:?}", code, operation)),
        },
        mtp_rs::Error::InvalidData { message } => BackendError::Io(format!("invalid data from device: {}", message)),
        mtp_rs::Error::Io(io_err) => BackendError::Io(io_err.to_string()),
        mtp_rs::Error::Usb(usb_err) => {
            let msg = usb_err.to_string().to_lowercase();
            if msg.contains("exclusive access") || msg.contains("device or resource busy") {
                BackendError::ExclusiveAccess(None)
            } else {
                BackendError::Io(format!("USB error: {}", usb_err))
            }
        }
    }
}
