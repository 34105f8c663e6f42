//! Event plumbing: the inbound device event feed and the outbound lifecycle events.
//!
//! Inbound events (`DeviceEvent`) are queued on an unbounded tokio channel and
//! consumed one at a time by `SessionManager::run`. Outbound events
//! (`SessionEvent`) go to an `EventSink`; rendering them is the sink's business.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::SessionError;
use crate::device::{DeviceHandle, DeviceInfo, StorageUnit};

/// Something that happened to a device, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    DeviceAttached(DeviceHandle),
    DeviceDetached(String),
    PermissionResult { device_id: String, granted: bool },
    /// Explicit user action or caller-driven retry.
    OpenRequested(String),
    CloseRequested(String),
    /// A transfer saw the channel die under it.
    ChannelLost(String),
}

/// Sending half of the device event queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventFeed {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

/// Receiving half of the device event queue.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

/// Creates a connected feed/queue pair.
pub fn event_feed() -> (EventFeed, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventFeed { tx }, EventQueue { rx })
}

impl EventFeed {
    /// Queues an event. Returns false if the queue has been dropped.
    pub fn send(&self, event: DeviceEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Device event dropped, queue closed: {:?}", e.0);
                false
            }
        }
    }

    pub fn attached(&self, device: DeviceHandle) -> bool {
        self.send(DeviceEvent::DeviceAttached(device))
    }

    pub fn detached(&self, device_id: &str) -> bool {
        self.send(DeviceEvent::DeviceDetached(device_id.to_string()))
    }

    pub fn permission_result(&self, device_id: &str, granted: bool) -> bool {
        self.send(DeviceEvent::PermissionResult {
            device_id: device_id.to_string(),
            granted,
        })
    }

    pub fn open_requested(&self, device_id: &str) -> bool {
        self.send(DeviceEvent::OpenRequested(device_id.to_string()))
    }

    pub fn close_requested(&self, device_id: &str) -> bool {
        self.send(DeviceEvent::CloseRequested(device_id.to_string()))
    }

    pub fn channel_lost(&self, device_id: &str) -> bool {
        self.send(DeviceEvent::ChannelLost(device_id.to_string()))
    }
}

impl EventQueue {
    /// Waits for the next event. `None` once every feed is dropped.
    pub async fn next(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }
}

/// Which step of opening a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenStage {
    /// Acquiring the native handle to the device.
    Channel,
    /// Starting the MTP session over the handle.
    Protocol,
    /// Enumerating storage units on the fresh session.
    Storage,
}

/// Why a device left the `Open`/`Attached` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The OS reported the device gone.
    Unplugged,
    /// A transfer found the channel dead.
    ChannelLost,
}

/// Type of transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Read,
    Write,
}

/// Lifecycle notification produced by the session core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum SessionEvent {
    Attached {
        device: DeviceHandle,
    },
    Detached {
        device_id: String,
        reason: DetachReason,
    },
    PermissionRequested {
        device_id: String,
    },
    PermissionGranted {
        device_id: String,
    },
    PermissionDenied {
        device_id: String,
    },
    SessionOpened {
        device_id: String,
        /// What the device reported about itself in its DeviceInfo dataset.
        device_info: DeviceInfo,
        storages: Vec<StorageUnit>,
    },
    SessionOpenFailed {
        device_id: String,
        stage: OpenStage,
        error: SessionError,
    },
    SessionClosed {
        device_id: String,
    },
    TransferCompleted {
        device_id: String,
        operation_id: String,
        direction: TransferDirection,
        bytes: u64,
    },
    TransferFailed {
        device_id: String,
        operation_id: String,
        direction: TransferDirection,
        reason: String,
    },
}

/// Receives lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Attached { device } => {
                info!("Device attached: {} ({})", device.display_name(), device.id)
            }
            SessionEvent::Detached { device_id, reason } => info!("Device detached: {} ({:?})", device_id, reason),
            SessionEvent::PermissionRequested { device_id } => info!("Permission requested for {}", device_id),
            SessionEvent::PermissionGranted { device_id } => info!("Permission granted for {}", device_id),
            SessionEvent::PermissionDenied { device_id } => warn!("Permission denied for {}", device_id),
            SessionEvent::SessionOpened {
                device_id,
                device_info,
                storages,
            } => info!(
                "MTP session opened on {} ({} {}, {} storages)",
                device_id,
                device_info.manufacturer.as_deref().unwrap_or("unknown manufacturer"),
                device_info.model.as_deref().unwrap_or("unknown model"),
                storages.len()
            ),
            SessionEvent::SessionOpenFailed {
                device_id,
                stage,
                error,
            } => warn!("Failed to open {} at {:?} stage: {}", device_id, stage, error),
            SessionEvent::SessionClosed { device_id } => info!("MTP session closed on {}", device_id),
            SessionEvent::TransferCompleted {
                operation_id,
                direction,
                bytes,
                ..
            } => info!("Transfer {} ({:?}) complete: {} bytes", operation_id, direction, bytes),
            SessionEvent::TransferFailed {
                operation_id,
                direction,
                reason,
                ..
            } => warn!("Transfer {} ({:?}) failed: {}", operation_id, direction, reason),
        }
    }
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("Session event dropped, receiver closed");
        }
    }
}

/// Fans one event out to several sinks.
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: SessionEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
