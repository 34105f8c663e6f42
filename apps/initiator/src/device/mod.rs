//! USB-side device identity, discovery and hotplug watching.

#[cfg(any(target_os = "macos", target_os = "linux"))]
mod discovery;
mod types;
#[cfg(any(target_os = "macos", target_os = "linux"))]
mod watcher;

#[cfg(any(target_os = "macos", target_os = "linux"))]
pub use discovery::list_mtp_devices;
pub use types::{
    DeviceHandle, DeviceInfo, ObjectHandle, ObjectRef, StorageId, StorageUnit, TransferObject,
    device_id_for_location,
};
#[cfg(any(target_os = "macos", target_os = "linux"))]
pub use watcher::DeviceWatcher;
