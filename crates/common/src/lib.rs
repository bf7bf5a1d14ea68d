//! Common utilities for the USB card reader
//!
//! This crate provides the pieces shared between the reader binary and its tests:
//! the device descriptor model, error handling, logging setup and the channel
//! bridge that carries session events in and UI notifications out.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    SessionBridge, SessionEvent, SessionWorker, UiEvent, UiHandler, create_session_bridge,
    notify_ui,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    DeviceDescriptor, DeviceLocation, EndpointDescriptor, EndpointDirection, EndpointHandle,
    InterfaceDescriptor, SessionId, TransferKind,
};
