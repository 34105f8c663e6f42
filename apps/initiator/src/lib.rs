//! Host-side MTP initiator: attach a USB device, negotiate transfer
//! permission, open an MTP session and move files through it.
//!
//! The core is UI-free. Device events go in through an `EventFeed`,
//! lifecycle notifications come out through an `EventSink`, and all device
//! I/O goes through a `DeviceBackend`.

pub mod backend;
pub mod demo;
pub mod device;
pub mod session;
pub mod settings;
pub mod store;

pub use session::{SessionError, SessionManager, SessionState};
pub use store::{ObjectListing, ObjectStore};
