//! Device, storage and object types shared by the session core and the backends.
//!
//! Everything here serializes to camelCase JSON so events can be forwarded as-is.

use serde::{Deserialize, Serialize};

/// Identifies one physical device.
///
/// Created when an attach is observed and invalid once the device detaches.
/// The session core borrows it for the lifetime of an attachment cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHandle {
    /// Format: "mtp-{location_id}".
    pub id: String,
    /// Stable for a given USB port.
    pub location_id: u64,
    /// For example, 0x18d1 for Google.
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl DeviceHandle {
    /// Creates a handle with only the USB identifiers known.
    pub fn new(location_id: u64, vendor_id: u16, product_id: u16) -> Self {
        Self {
            id: device_id_for_location(location_id),
            location_id,
            vendor_id,
            product_id,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Sets the product name.
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    /// Fills in whatever the session reported. Known values are kept when the device reports nothing.
    pub fn apply_info(&mut self, info: &DeviceInfo) {
        if info.manufacturer.is_some() {
            self.manufacturer = info.manufacturer.clone();
        }
        if info.model.is_some() {
            self.product = info.model.clone();
        }
        if info.serial_number.is_some() {
            self.serial_number = info.serial_number.clone();
        }
    }

    /// Returns a display name for the device.
    ///
    /// Prefers product name, falls back to "MTP device (vendor:product)".
    pub fn display_name(&self) -> String {
        if let Some(product) = &self.product {
            return product.clone();
        }
        if let Some(manufacturer) = &self.manufacturer {
            return format!("{} device", manufacturer);
        }
        format!("MTP device ({:04x}:{:04x})", self.vendor_id, self.product_id)
    }
}

/// Builds the device id used across the crate.
pub fn device_id_for_location(location_id: u64) -> String {
    format!("mtp-{}", location_id)
}

/// Identity strings a device reports once a session is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// For example, "Pixel 8".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl DeviceInfo {
    /// Builds info from raw descriptor strings; empty strings mean "not reported".
    pub fn from_descriptors(manufacturer: &str, model: &str, serial_number: &str) -> Self {
        let non_empty = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
        Self {
            manufacturer: non_empty(manufacturer),
            model: non_empty(model),
            serial_number: non_empty(serial_number),
        }
    }
}

/// MTP storage id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageId(pub u32);

/// MTP object handle, unique within a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(pub u32);

/// An addressable storage root on an open session.
///
/// Android devices typically have one or more storages: "Internal Storage", "SD Card", etc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUnit {
    pub id: StorageId,
    /// For example, "Internal shared storage".
    pub description: String,
    /// In bytes.
    pub total_bytes: u64,
    /// In bytes.
    pub available_bytes: u64,
    pub is_read_only: bool,
}

/// Addresses one object on a storage unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub storage: StorageId,
    pub handle: ObjectHandle,
}

/// A file-like object on a storage unit, as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferObject {
    pub storage: StorageId,
    pub handle: ObjectHandle,
    pub name: String,
    /// In bytes. Zero for folders.
    pub size: u64,
    /// Folders are "associations" in MTP terms.
    pub is_folder: bool,
    /// `None` for root-level objects or when the listing did not say.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ObjectHandle>,
}

impl TransferObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            storage: self.storage,
            handle: self.handle,
        }
    }
}
