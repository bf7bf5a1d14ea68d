//! Host-side USB access seam
//!
//! The session manager only talks to the platform through these two traits, so
//! the state machine can run against libusb in production and an in-memory host
//! in tests.

use common::{DeviceDescriptor, EndpointHandle};
use std::sync::Arc;
use std::time::Duration;

/// Access to the devices attached to this host
pub trait UsbHost: Send {
    /// Snapshot every attached device, in enumeration order
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, rusb::Error>;

    /// Open the device and claim the endpoint's interface
    ///
    /// Any kernel driver bound to the interface is detached first.
    fn open(
        &self,
        device: &DeviceDescriptor,
        endpoint: &EndpointHandle,
    ) -> Result<Arc<dyn DeviceLink>, rusb::Error>;
}

/// An opened device with its interface claimed
///
/// Shared between the session manager (which releases it) and the polling reader
/// (which reads from it). Reads after `release` must fail with
/// `rusb::Error::NoDevice` instead of touching the device.
pub trait DeviceLink: Send + Sync {
    /// Read one interrupt packet, blocking up to `timeout`
    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Release the claimed interface and give the device back to the kernel
    ///
    /// Idempotent.
    fn release(&self);

    /// Whether `release` has been called
    fn is_released(&self) -> bool;
}
