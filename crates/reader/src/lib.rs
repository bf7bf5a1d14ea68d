//! USB card reader host
//!
//! Finds a vendor-specific card reader on the bus, asks for access, claims its
//! single interrupt IN endpoint and streams decoded reads to a console UI.

pub mod config;
pub mod display;
pub mod error;
pub mod permission;
pub mod session;
pub mod usb;

pub use error::{SessionError, TopologyMismatch};
pub use permission::{PermissionBroker, PermissionMode, PolicyBroker};
pub use session::{SessionManager, SessionSettings, SessionStatus, spawn_session_manager};
