//! Transfer permission tracking.
//!
//! One record per known device id. Prompts go out through a
//! `PermissionPrompt`; answers come back later on the device event feed and
//! are only accepted while the record is `Pending`.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::events::{EventFeed, EventSink, SessionEvent};
use crate::device::DeviceHandle;

/// Permission record for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionState {
    Unrequested,
    Pending,
    Granted,
    Denied,
}

/// Issues the external permission prompt. The answer must arrive as a
/// `PermissionResult` event, never as a return value.
pub trait PermissionPrompt: Send + Sync {
    fn prompt(&self, device: &DeviceHandle);
}

/// Tracks whether the process may transfer to each known device.
pub struct PermissionGate {
    records: HashMap<String, PermissionState>,
    prompt: Arc<dyn PermissionPrompt>,
    sink: Arc<dyn EventSink>,
}

impl PermissionGate {
    pub fn new(prompt: Arc<dyn PermissionPrompt>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            records: HashMap::new(),
            prompt,
            sink,
        }
    }

    /// Starts tracking a device with an `Unrequested` record. Existing records are kept.
    pub fn track(&mut self, device_id: &str) {
        self.records
            .entry(device_id.to_string())
            .or_insert(PermissionState::Unrequested);
    }

    /// Current record. Unknown devices read as `Unrequested`.
    pub fn state(&self, device_id: &str) -> PermissionState {
        self.records
            .get(device_id)
            .copied()
            .unwrap_or(PermissionState::Unrequested)
    }

    /// Asks for permission unless a request is outstanding or already granted.
    ///
    /// Returns true if a prompt was issued.
    pub fn request_permission(&mut self, device: &DeviceHandle) -> bool {
        let record = self
            .records
            .entry(device.id.clone())
            .or_insert(PermissionState::Unrequested);
        match *record {
            PermissionState::Pending | PermissionState::Granted => {
                debug!("request_permission: {} already {:?}, not prompting", device.id, *record);
                false
            }
            PermissionState::Unrequested | PermissionState::Denied => {
                *record = PermissionState::Pending;
                info!("Requesting transfer permission for {}", device.id);
                self.prompt.prompt(device);
                self.sink.emit(SessionEvent::PermissionRequested {
                    device_id: device.id.clone(),
                });
                true
            }
        }
    }

    /// Applies a prompt answer.
    ///
    /// Returns the new state if the answer was accepted, `None` if it arrived
    /// while no request was outstanding.
    pub fn on_permission_result(&mut self, device_id: &str, granted: bool) -> Option<PermissionState> {
        match self.records.get_mut(device_id) {
            Some(record) if *record == PermissionState::Pending => {
                *record = if granted {
                    PermissionState::Granted
                } else {
                    PermissionState::Denied
                };
                debug!("Permission for {} is now {:?}", device_id, *record);
                Some(*record)
            }
            Some(record) => {
                warn!(
                    "Ignoring permission result (granted={}) for {}: record is {:?}, not Pending",
                    granted, device_id, *record
                );
                None
            }
            None => {
                warn!(
                    "Ignoring permission result (granted={}) for unknown device {}",
                    granted, device_id
                );
                None
            }
        }
    }

    pub fn has_permission(&self, device_id: &str) -> bool {
        self.state(device_id) == PermissionState::Granted
    }

    /// Drops the record; permission never survives a re-attach.
    pub fn forget(&mut self, device_id: &str) {
        if self.records.remove(device_id).is_some() {
            debug!("Cleared permission record for {}", device_id);
        }
    }
}

/// Which devices the desktop prompt lets through.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "mode")]
pub enum PermissionPolicy {
    #[default]
    AllowAll,
    DenyAll,
    AllowVendors {
        #[serde(alias = "vendor_ids", default)]
        vendor_ids: Vec<u16>,
    },
}

impl PermissionPolicy {
    pub fn allows(&self, device: &DeviceHandle) -> bool {
        match self {
            Self::AllowAll => true,
            Self::DenyAll => false,
            Self::AllowVendors { vendor_ids } => vendor_ids.contains(&device.vendor_id),
        }
    }
}

/// Prompt that answers from a configured policy instead of asking a person.
///
/// The answer is queued on the event feed, so it is processed after the
/// current event completes, the same as an interactive answer would be.
pub struct PolicyPrompt {
    policy: PermissionPolicy,
    feed: EventFeed,
}

impl PolicyPrompt {
    pub fn new(policy: PermissionPolicy, feed: EventFeed) -> Self {
        Self { policy, feed }
    }
}

impl PermissionPrompt for PolicyPrompt {
    fn prompt(&self, device: &DeviceHandle) {
        let granted = self.policy.allows(device);
        debug!(
            "PolicyPrompt: {} ({:04x}:{:04x}) -> granted={}",
            device.id, device.vendor_id, device.product_id, granted
        );
        self.feed.permission_result(&device.id, granted);
    }
}
