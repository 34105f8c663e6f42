//! Device session core: permission tracking, the lifecycle state machine and its events.

mod errors;
mod events;
mod manager;
mod permission;
mod state;

#[cfg(test)]
mod manager_test;

pub use errors::SessionError;
pub use events::{
    ChannelSink, DetachReason, DeviceEvent, EventFeed, EventQueue, EventSink, FanoutSink, LogSink, OpenStage,
    SessionEvent, TransferDirection, event_feed,
};
pub use manager::{
    DEFAULT_OPEN_TIMEOUT_SECS, DEFAULT_TRANSFER_TIMEOUT_SECS, ManagerOptions, SessionManager, SessionSlot,
};
pub use permission::{PermissionGate, PermissionPolicy, PermissionPrompt, PermissionState, PolicyPrompt};
pub use state::SessionState;
