//! MTP device discovery.
//!
//! Lists connected MTP devices without opening sessions.

use super::types::DeviceHandle;
use log::{debug, warn};
use mtp_rs::MtpDevice;

/// Lists all connected MTP devices.
///
/// Does not open connections to the devices, so it's fast and doesn't
/// disturb a session another process holds. Returns an empty vector if
/// enumeration fails.
pub fn list_mtp_devices() -> Vec<DeviceHandle> {
    match MtpDevice::list_devices() {
        Ok(devices) => {
            debug!("Found {} MTP device(s)", devices.len());
            devices
                .into_iter()
                .map(|d| {
                    // mtp-rs doesn't expose string descriptors in list_devices(), they come with the session
                    let device = DeviceHandle::new(d.location_id, d.vendor_id, d.product_id);
                    debug!(
                        "MTP device: id={}, vendor={:04x}, product={:04x}",
                        device.id, device.vendor_id, device.product_id
                    );
                    device
                })
                .collect()
        }
        Err(e) => {
            warn!("Failed to enumerate MTP devices: {}", e);
            Vec::new()
        }
    }
}
