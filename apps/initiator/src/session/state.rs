//! Session lifecycle states.

use serde::Serialize;

/// Where the current device is in its attachment cycle.
///
/// `Detached` and `Closed` end a cycle; a new attach restarts at `Attached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Detached,
    Attached,
    PermissionPending,
    Authorized,
    Open,
    Closed,
}

impl SessionState {
    /// Transfers are only valid while open.
    pub fn accepts_transfers(self) -> bool {
        self == Self::Open
    }

    /// Whether an open request can be honored from this state.
    pub fn can_open(self) -> bool {
        matches!(self, Self::Authorized | Self::Open)
    }
}
