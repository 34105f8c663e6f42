//! USB hotplug watcher for MTP devices.
//!
//! Turns nusb hotplug notifications into `DeviceAttached`/`DeviceDetached`
//! events on the session event feed. A USB event only triggers a rescan;
//! the set of MTP devices is diffed against the last scan, so non-MTP
//! devices never reach the session core.

use log::{debug, error, info, warn};
use nusb::hotplug::HotplugEvent;
use std::collections::HashMap;
use std::time::Duration;

use super::discovery::list_mtp_devices;
use super::types::DeviceHandle;
use crate::session::EventFeed;

/// Time a freshly connected device gets to finish USB enumeration before we scan.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Watches for MTP devices coming and going.
pub struct DeviceWatcher {
    feed: EventFeed,
    known: HashMap<String, DeviceHandle>,
}

impl DeviceWatcher {
    pub fn new(feed: EventFeed) -> Self {
        Self {
            feed,
            known: HashMap::new(),
        }
    }

    /// Spawns the watcher. Devices already connected are reported as attached first.
    pub fn start(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.rescan();
            info!("MTP device watcher started ({} device(s) present)", self.known.len());
            self.run().await;
        })
    }

    async fn run(&mut self) {
        let mut stream = match nusb::watch_devices() {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start USB hotplug watcher: {}", e);
                return;
            }
        };

        use futures_util::StreamExt;
        while let Some(event) = stream.next().await {
            match event {
                HotplugEvent::Connected(device_info) => {
                    debug!(
                        "USB device connected: {:04x}:{:04x}",
                        device_info.vendor_id(),
                        device_info.product_id()
                    );
                    tokio::time::sleep(SETTLE_DELAY).await;
                    self.rescan();
                }
                HotplugEvent::Disconnected(device_id) => {
                    debug!("USB device disconnected: {:?}", device_id);
                    self.rescan();
                }
            }
        }

        warn!("USB hotplug watcher stream ended unexpectedly");
    }

    fn rescan(&mut self) {
        self.apply(list_mtp_devices());
    }

    /// Reports the difference between the last scan and `current`.
    fn apply(&mut self, current: Vec<DeviceHandle>) {
        let current: HashMap<String, DeviceHandle> = current.into_iter().map(|d| (d.id.clone(), d)).collect();

        for (id, device) in &current {
            if !self.known.contains_key(id) {
                debug!("MTP device detected: {}", id);
                self.feed.attached(device.clone());
            }
        }
        for id in self.known.keys() {
            if !current.contains_key(id) {
                debug!("MTP device removed: {}", id);
                self.feed.detached(id);
            }
        }

        self.known = current;
    }
}
