//! Error types for session lifecycle and transfer operations.

use crate::backend::BackendError;

/// Error types for session lifecycle and transfer operations.
///
/// None of these are fatal to the manager: open failures leave the device
/// `Authorized` for a later retry, and transfer failures leave the session
/// `Open` unless the channel itself is gone.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SessionError {
    /// No device is attached.
    NoDevice,
    /// Transfer permission has not been granted for the device.
    PermissionDenied { device_id: String },
    /// Could not get a native handle to the device.
    ChannelOpenFailed { device_id: String, reason: String },
    /// Got a handle, but the MTP session (or its storage enumeration) failed.
    SessionOpenFailed { device_id: String, reason: String },
    /// The session is not open (never opened, closed, or lost).
    NotOpen { device_id: String },
    /// The device exposes no storage unit (for example, a locked phone).
    NoStorage { device_id: String },
    /// Object handle is stale: deleted, or the session closed mid-read.
    ObjectNotFound { device_id: String, handle: u32 },
    /// The device refused a write.
    WriteRejected { device_id: String, reason: String },
    /// Transport or protocol failure during a transfer.
    ProtocolIo { device_id: String, message: String },
    /// The operation did not finish within the configured timeout.
    Timeout { device_id: String },
    /// The device went away; the session was released.
    Disconnected { device_id: String },
    /// This build cannot reach MTP devices.
    UnsupportedPlatform { message: String },
}

impl SessionError {
    /// Returns true if the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ChannelOpenFailed { .. } | Self::SessionOpenFailed { .. }
        )
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoDevice => "No device attached. Connect a device in file transfer mode.".to_string(),
            Self::PermissionDenied { .. } => {
                "Access to the device was not granted. Reconnect it to be asked again.".to_string()
            }
            Self::ChannelOpenFailed { reason, .. } => {
                format!("Couldn't open the device ({}). Close other apps using it and try again.", reason)
            }
            Self::SessionOpenFailed { reason, .. } => {
                format!("The device didn't start a transfer session ({}). Unlock it and try again.", reason)
            }
            Self::NotOpen { .. } => "No transfer session is open. Open the device first.".to_string(),
            Self::NoStorage { .. } => "The device has no accessible storage. Unlock it and reconnect.".to_string(),
            Self::ObjectNotFound { .. } => "File not found. It may have been deleted.".to_string(),
            Self::WriteRejected { reason, .. } => format!("The device refused the write: {}.", reason),
            Self::ProtocolIo { message, .. } => format!("Device reported an error: {}. Try reconnecting.", message),
            Self::Timeout { .. } => {
                "The operation timed out. The device may be slow or unresponsive. Try again.".to_string()
            }
            Self::Disconnected { .. } => "Device was disconnected. Reconnect it to continue.".to_string(),
            Self::UnsupportedPlatform { message } => message.clone(),
        }
    }

    /// Maps a backend failure while opening the channel.
    pub(crate) fn channel_open(e: BackendError, device_id: &str) -> Self {
        match e {
            BackendError::Unsupported(message) => Self::UnsupportedPlatform { message },
            other => Self::ChannelOpenFailed {
                device_id: device_id.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Maps a backend failure while opening the protocol session or enumerating storage.
    pub(crate) fn session_open(e: BackendError, device_id: &str) -> Self {
        match e {
            BackendError::Unsupported(message) => Self::UnsupportedPlatform { message },
            other => Self::SessionOpenFailed {
                device_id: device_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevice => write!(f, "No device attached"),
            Self::PermissionDenied { device_id } => write!(f, "Permission denied for device: {device_id}"),
            Self::ChannelOpenFailed { device_id, reason } => {
                write!(f, "Failed to open channel to {device_id}: {reason}")
            }
            Self::SessionOpenFailed { device_id, reason } => {
                write!(f, "Failed to open MTP session on {device_id}: {reason}")
            }
            Self::NotOpen { device_id } => write!(f, "Session not open for device: {device_id}"),
            Self::NoStorage { device_id } => write!(f, "No storage available on device: {device_id}"),
            Self::ObjectNotFound { device_id, handle } => {
                write!(f, "Object not found on {device_id}: handle {handle}")
            }
            Self::WriteRejected { device_id, reason } => write!(f, "Write rejected by {device_id}: {reason}"),
            Self::ProtocolIo { device_id, message } => write!(f, "Protocol error for {device_id}: {message}"),
            Self::Timeout { device_id } => write!(f, "Operation timed out for device: {device_id}"),
            Self::Disconnected { device_id } => write!(f, "Device disconnected: {device_id}"),
            Self::UnsupportedPlatform { message } => write!(f, "Unsupported platform: {message}"),
        }
    }
}

impl std::error::Error for SessionError {}
