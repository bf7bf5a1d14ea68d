//! Test utilities for the card reader crates
//!
//! Builders for descriptor snapshots plus small timing helpers used by the
//! session and reader tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_card_reader, CARD_READER_PID, CARD_READER_VID};
//!
//! let device = create_card_reader(1, 4);
//! assert_eq!(device.vendor_id, CARD_READER_VID);
//! assert_eq!(device.product_id, CARD_READER_PID);
//! ```

use crate::usb_types::{
    DeviceDescriptor, DeviceLocation, EndpointDescriptor, EndpointDirection, InterfaceDescriptor,
    TransferKind,
};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor ID of the magnetic stripe reader (2303)
pub const CARD_READER_VID: u16 = 0x08ff;

/// Product ID of the magnetic stripe reader (9)
pub const CARD_READER_PID: u16 = 0x0009;

/// Create an endpoint descriptor
pub fn create_endpoint(
    address: u8,
    transfer_kind: TransferKind,
    max_packet_size: u16,
) -> EndpointDescriptor {
    let direction = if address & 0x80 != 0 {
        EndpointDirection::In
    } else {
        EndpointDirection::Out
    };

    EndpointDescriptor {
        address,
        direction,
        transfer_kind,
        max_packet_size,
    }
}

/// Create an interrupt IN endpoint (0x81) with the given max packet size
pub fn create_interrupt_in(max_packet_size: u16) -> EndpointDescriptor {
    create_endpoint(0x81, TransferKind::Interrupt, max_packet_size)
}

/// Create a device with an explicit interface/endpoint layout
///
/// # Arguments
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
/// * `location` - (bus, address)
/// * `interfaces` - endpoints per interface, interface numbers assigned in order
pub fn create_device(
    vendor_id: u16,
    product_id: u16,
    location: (u8, u8),
    interfaces: Vec<Vec<EndpointDescriptor>>,
) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        location: DeviceLocation::new(location.0, location.1),
        interfaces: interfaces
            .into_iter()
            .enumerate()
            .map(|(number, endpoints)| InterfaceDescriptor {
                number: number as u8,
                endpoints,
            })
            .collect(),
    }
}

/// Create the expected card reader: one interface, one interrupt IN endpoint of 8 bytes
pub fn create_card_reader(bus: u8, address: u8) -> DeviceDescriptor {
    create_device(
        CARD_READER_VID,
        CARD_READER_PID,
        (bus, address),
        vec![vec![create_interrupt_in(8)]],
    )
}

/// Create an unrelated device (keyboard-like, different VID/PID)
pub fn create_other_device(bus: u8, address: u8) -> DeviceDescriptor {
    create_device(
        0x046d,
        0xc52b,
        (bus, address),
        vec![vec![create_interrupt_in(8)]],
    )
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was observed.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
